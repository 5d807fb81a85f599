//! Gateway process errors.

use thiserror::Error;

use cluster_core::error::NetError;
use wire_proto::ProtoError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("No live instance for service '{0}'")]
    NoServer(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
