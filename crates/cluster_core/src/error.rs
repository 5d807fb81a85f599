//! Error types for the command layer.

use thiserror::Error;
use wire_proto::ProtoError;

/// Errors surfaced by connections, dispatch, and outbound links.
///
/// Transport-level failures (`Proto` with a frame or signature error,
/// `AuthTimeout`, `Io`) terminate the connection that produced them.
/// `WriteTooBusy`, `TooLargeMessage`, `InvalidMessageId`, and `Json`
/// are scoped to a single write or request and leave the connection
/// alive.
#[derive(Debug, Error)]
pub enum NetError {
    /// The outbound queue is full. The caller decides whether to drop
    /// or retry; the write never blocks.
    #[error("outbound queue full")]
    WriteTooBusy,

    /// The payload exceeds the maximum message size. Non-fatal: the
    /// connection is kept alive so a legitimate backlog can drain.
    #[error("message too large: {0} bytes")]
    TooLargeMessage(usize),

    /// The connection (or queue) has been closed.
    #[error("connection closed")]
    Closed,

    /// No auth frame arrived within the handshake deadline.
    #[error("authentication timed out")]
    AuthTimeout,

    /// The peer violated the connection protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// No handler is registered for the message id. Per-request; the
    /// connection stays alive.
    #[error("unknown message id: {0}")]
    InvalidMessageId(String),

    /// No session with this id is registered.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The outbound link for this service has no live connection.
    #[error("no live connection to service: {0}")]
    NotConnected(String),

    /// Wire codec or signature failure.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// A message body failed to decode; surfaced to the caller of the
    /// originating request only.
    #[error("body decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stream I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
