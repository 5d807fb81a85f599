//! Length-prefixed binary framing.
//!
//! Frames bytes on a stream socket. The header is always 4 bytes:
//! kind, big-endian payload length, and a reserved zero byte. Only
//! `Raw` and `Auth` frames carry a payload; the control kinds return
//! immediately after the header.

use crate::error::ProtoError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a logical message crossing the cluster, enforced on
/// every envelope write. The frame length field itself is a `u16`, so
/// a single frame payload is additionally bounded by 64 KiB.
pub const MAX_MESSAGE_SIZE: usize = 96 * 1024;

/// The kind byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A signed envelope carrying application traffic.
    Raw = 0,
    /// Orderly connection shutdown. Header-only.
    Close = 1,
    /// Liveness probe. Header-only.
    Ping = 2,
    /// Liveness reply. Header-only.
    Pong = 3,
    /// The first frame on a new service-to-service connection,
    /// verified by the auth parser. An empty `Auth` frame is a pure
    /// heartbeat and is legal during the handshake phase.
    Auth = 4,
}

impl FrameKind {
    /// Whether frames of this kind carry a payload.
    pub fn carries_payload(self) -> bool {
        matches!(self, FrameKind::Raw | FrameKind::Auth)
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FrameKind::Raw),
            1 => Some(FrameKind::Close),
            2 => Some(FrameKind::Ping),
            3 => Some(FrameKind::Pong),
            4 => Some(FrameKind::Auth),
            _ => None,
        }
    }
}

/// Encodes one frame into a freshly allocated buffer.
///
/// Control kinds must have an empty payload. `Raw` requires a
/// non-empty payload; `Auth` may be empty (handshake heartbeat).
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if !kind.carries_payload() && !payload.is_empty() {
        return Err(ProtoError::InvalidFrame("control frame with payload"));
    }
    if kind == FrameKind::Raw && payload.is_empty() {
        return Err(ProtoError::InvalidFrame("empty raw frame"));
    }
    if payload.len() >= MAX_MESSAGE_SIZE || payload.len() > u16::MAX as usize {
        return Err(ProtoError::TooLargeMessage(payload.len()));
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.push(kind as u8);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.push(0); // reserved
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes one complete frame from a byte slice.
///
/// Used on message-oriented transports (WebSocket binary messages)
/// where a whole frame arrives at once. The slice must contain exactly
/// one frame; trailing bytes are a framing violation.
pub fn decode_frame(buf: &[u8]) -> Result<(FrameKind, &[u8]), ProtoError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(ProtoError::InvalidFrame("truncated frame header"));
    }
    let kind =
        FrameKind::from_byte(buf[0]).ok_or(ProtoError::InvalidFrame("unknown frame kind"))?;
    let length = u16::from_be_bytes([buf[1], buf[2]]) as usize;

    if !kind.carries_payload() && length != 0 {
        return Err(ProtoError::InvalidFrame("control frame declares payload"));
    }
    if kind == FrameKind::Raw && length == 0 {
        return Err(ProtoError::InvalidFrame("empty raw frame"));
    }
    if length >= MAX_MESSAGE_SIZE {
        return Err(ProtoError::InvalidFrame("payload length out of range"));
    }
    if buf.len() != FRAME_HEADER_LEN + length {
        return Err(ProtoError::InvalidFrame("frame length mismatch"));
    }
    Ok((kind, &buf[FRAME_HEADER_LEN..]))
}

/// Reads exactly one frame from the stream.
///
/// Reads the 4 header bytes, then exactly `length` payload bytes for
/// the payload-bearing kinds. Any violation of the framing contract is
/// an [`ProtoError::InvalidFrame`] and the caller must close the
/// connection; the stream cannot be recovered.
pub async fn read_frame<R>(reader: &mut R) -> Result<(FrameKind, Vec<u8>), ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let kind =
        FrameKind::from_byte(header[0]).ok_or(ProtoError::InvalidFrame("unknown frame kind"))?;
    let length = u16::from_be_bytes([header[1], header[2]]) as usize;

    if !kind.carries_payload() {
        if length != 0 {
            return Err(ProtoError::InvalidFrame("control frame declares payload"));
        }
        return Ok((kind, Vec::new()));
    }

    if length == 0 {
        // An empty Auth frame is a heartbeat; an empty Raw frame is
        // a framing violation.
        return if kind == FrameKind::Auth {
            Ok((kind, Vec::new()))
        } else {
            Err(ProtoError::InvalidFrame("empty raw frame"))
        };
    }
    if length >= MAX_MESSAGE_SIZE {
        return Err(ProtoError::InvalidFrame("payload length out of range"));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok((kind, payload))
}

/// Encodes and writes one frame to the stream.
pub async fn write_frame<W>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(kind, payload)?;
    writer.write_all(&buf).await?;
    Ok(())
}
