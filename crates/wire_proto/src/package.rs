//! The JSON envelope carried inside `Raw` and `Auth` frames.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ProtoError;

/// One logical message crossing the cluster.
///
/// All fields are omitted from the serialized form when empty, which
/// keeps the signed buffer minimal and stable. `Data` is kept as raw
/// JSON so the envelope never re-serializes a handler's payload.
///
/// Message ids crossing the gateway boundary use the
/// `<serviceName>.<messageId>` form; purely local/system ids are bare
/// names (`FUNC_Close`, `HeartBeat`, `S2C_*`, `C2S_*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Package {
    /// Message id, optionally `<serviceName>.`-prefixed.
    #[serde(rename = "Id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Message body as a raw JSON object.
    #[serde(rename = "Data", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,

    /// MD5 signature over the serialized envelope. Fixed length per
    /// parser variant; patched in place after serialization.
    #[serde(rename = "Sign", default, skip_serializing_if = "String::is_empty")]
    pub sign: String,

    /// Session id of the originating client-facing connection.
    #[serde(rename = "Ssid", default, skip_serializing_if = "String::is_empty")]
    pub ssid: String,

    /// Protocol version.
    #[serde(rename = "Ver", default, skip_serializing_if = "is_zero_i32")]
    pub ver: i32,

    /// Unix timestamp in seconds; set on auth envelopes for replay
    /// protection.
    #[serde(rename = "Ts", default, skip_serializing_if = "is_zero_i64")]
    pub ts: i64,

    /// Name of the sending process.
    #[serde(rename = "ServerName", default, skip_serializing_if = "String::is_empty")]
    pub server_name: String,

    /// Remote address of the originating client.
    #[serde(rename = "ClientAddr", default, skip_serializing_if = "String::is_empty")]
    pub client_addr: String,
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

impl Package {
    /// Creates an envelope with just an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Creates an envelope with an id and a serialized body.
    pub fn with_body<T: Serialize>(id: impl Into<String>, body: &T) -> Result<Self, ProtoError> {
        let data = serde_json::value::to_raw_value(body)?;
        Ok(Self {
            id: id.into(),
            data: Some(data),
            ..Default::default()
        })
    }

    /// Body bytes for dispatch; an absent body normalizes to `{}`.
    pub fn data_bytes(&self) -> &[u8] {
        self.data
            .as_deref()
            .map(|raw| raw.get().as_bytes())
            .unwrap_or(b"{}")
    }
}

/// Current Unix time in whole seconds.
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_omitted() {
        let package = Package::new("HeartBeat");
        let json = serde_json::to_string(&package).unwrap();
        assert_eq!(json, r#"{"Id":"HeartBeat"}"#);
    }

    #[test]
    fn body_round_trips_as_raw_json() {
        #[derive(Serialize)]
        struct Body {
            room: String,
            seat: u32,
        }
        let package = Package::with_body(
            "room.C2S_Join",
            &Body {
                room: "lobby".into(),
                seat: 3,
            },
        )
        .unwrap();
        let json = serde_json::to_string(&package).unwrap();
        let parsed: Package = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "room.C2S_Join");
        assert_eq!(parsed.data_bytes(), br#"{"room":"lobby","seat":3}"#);
    }

    #[test]
    fn absent_body_normalizes_to_empty_object() {
        let package = Package::new("FUNC_Close");
        assert_eq!(package.data_bytes(), b"{}");
    }

    #[test]
    fn wire_field_names_match_the_protocol() {
        let package = Package {
            id: "x".into(),
            ssid: "s-1".into(),
            ver: 2,
            ts: 1700000000,
            server_name: "gate1".into(),
            client_addr: "10.0.0.1:4242".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&package).unwrap();
        for field in ["\"Id\"", "\"Ssid\"", "\"Ver\"", "\"Ts\"", "\"ServerName\"", "\"ClientAddr\""] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }
}
