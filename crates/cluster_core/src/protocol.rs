//! Bodies of the system envelopes exchanged between processes.
//!
//! These ride in the `Data` field of the well-known ids in
//! [`crate::ids`]. Like the envelope itself, wire field names are
//! PascalCase.

use serde::{Deserialize, Serialize};

/// Body of `Register`: a service or gateway announcing itself to the
/// router. `name` may be a comma-separated list of logical names the
/// instance serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterArgs {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub min_weight: i32,
    #[serde(default)]
    pub max_weight: i32,
    #[serde(default)]
    pub is_gateway: bool,
}

/// Body of `Concurrent`: a periodic load report from a live
/// connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConcurrentArgs {
    pub weight: i32,
}

/// Body of `S2C_ServerAvailable`: the router pushing one resolvable
/// service record to a gateway. Sent on registration and on weight
/// changes, so gateways balance on current weights without polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceNotice {
    pub name: String,
    pub addr: String,
    pub weight: i32,
    pub min_weight: i32,
    pub max_weight: i32,
}

/// Body of `S2C_ServerUnavailable`: a service went away (router to
/// gateway), or a requested target is unreachable (gateway to
/// client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UnavailableNotice {
    pub server_name: String,
}
