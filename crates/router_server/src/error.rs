//! Router process errors.

use thiserror::Error;

use cluster_core::error::NetError;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
