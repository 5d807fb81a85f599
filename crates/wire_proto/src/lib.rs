//! # Wire Protocol
//!
//! The binary wire protocol shared by every process in the cluster:
//! the length-prefixed frame codec, the JSON envelope ([`Package`]),
//! and the in-place MD5 signature scheme ([`SignParser`]).
//!
//! ## Frame layout
//!
//! Every unit on a stream socket is a frame with a 4-byte header:
//!
//! ```text
//! [kind: u8][length: u16 big-endian][reserved: u8]
//! ```
//!
//! followed by `length` payload bytes for the payload-bearing kinds
//! (`Raw` and `Auth`). `Ping`, `Pong`, and `Close` are header-only.
//!
//! ## Envelope
//!
//! The payload of a `Raw` or `Auth` frame is one JSON [`Package`]. The
//! `Sign` field carries an MD5 signature computed over the serialized
//! buffer with the shared key prepended; the signature is patched into
//! the buffer in place so the signed bytes are exactly the bytes on
//! the wire.
//!
//! ## Failure model
//!
//! Frame-level errors ([`ProtoError::InvalidFrame`]) are always fatal
//! to the connection: a corrupted stream cannot be resynchronized.
//! Signature errors ([`ProtoError::InvalidSign`],
//! [`ProtoError::PackageExpired`]) reject the connection or request
//! and are never retried transparently.

pub use error::ProtoError;
pub use frame::{
    decode_frame, encode_frame, read_frame, write_frame, FrameKind, FRAME_HEADER_LEN,
    MAX_MESSAGE_SIZE,
};
pub use package::{current_timestamp, Package};
pub use sign::{SignParser, AUTH_FRESHNESS_SECS, CLIENT_SIGN_REF};

pub mod error;
pub mod frame;
pub mod package;
pub mod sign;
