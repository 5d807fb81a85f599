//! Protocol error taxonomy.
//!
//! Frame errors are fatal to the connection that produced them;
//! signature errors reject the request or connection; size errors are
//! per-write and deliberately non-fatal so a backlog of legitimate
//! messages can still drain.

use thiserror::Error;

/// Errors produced by the wire codec and the signature scheme.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The frame header or payload violates the framing contract.
    /// Always fatal to the connection: there is no way to resync a
    /// corrupted stream.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// The payload exceeds the maximum message size. Per-write and
    /// non-fatal; the connection stays alive.
    #[error("message too large: {0} bytes")]
    TooLargeMessage(usize),

    /// The signature could not be located, patched, or verified.
    #[error("invalid package signature")]
    InvalidSign,

    /// An auth envelope's timestamp fell outside the freshness window.
    #[error("package expired")]
    PackageExpired,

    /// Envelope (de)serialization failed.
    #[error("envelope error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying stream I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
