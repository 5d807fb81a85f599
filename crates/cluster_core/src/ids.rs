//! Well-known message ids.
//!
//! Bare ids name local/system events; ids crossing the gateway
//! boundary are `<serviceName>.<messageId>`. `S2C_*` flows server to
//! client, `C2S_*` client to server.

/// Synthetic local message fired through the normal dispatch path
/// when a connection closes, so handlers can clean up.
pub const FUNC_CLOSE: &str = "FUNC_Close";

/// Liveness message; carries no body.
pub const HEART_BEAT: &str = "HeartBeat";

/// First envelope on a new service-to-service connection.
pub const AUTH: &str = "Auth";

/// Service registration with the router.
pub const REGISTER: &str = "Register";

/// Periodic load (weight) report to the router.
pub const CONCURRENT: &str = "Concurrent";

/// Router-to-gateway notice that a named service became resolvable
/// (or its weight changed).
pub const S2C_SERVER_AVAILABLE: &str = "S2C_ServerAvailable";

/// Router-to-gateway notice that a named service went away; also the
/// gateway-to-client notice that a requested target is unreachable.
pub const S2C_SERVER_UNAVAILABLE: &str = "S2C_ServerUnavailable";

/// Splits a `<serverName>.<msgId>` id; `None` for bare ids.
pub fn split_target(id: &str) -> Option<(&str, &str)> {
    id.split_once('.')
}
