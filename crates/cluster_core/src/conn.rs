//! Connection lifecycle.
//!
//! A [`Conn`] is the shared handle to one live connection: a bounded
//! outbound channel, a monotonic closed flag, and a shutdown broadcast
//! that unblocks the writer. The handle is transport-agnostic: the
//! TCP writer task lives here, the gateway drives the same handle from
//! a WebSocket sink.
//!
//! Lifecycle: `Handshaking → Established → Closing → Closed`. Inbound
//! service connections must present a verifiable `Auth` frame within
//! [`AUTH_DEADLINE`] before anything else is read. Closing is
//! idempotent; the shutdown broadcast fires exactly once, and the
//! owning process dispatches a synthetic `FUNC_Close` message so
//! handlers can clean up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;
use wire_proto::{encode_frame, read_frame, FrameKind, Package, SignParser, MAX_MESSAGE_SIZE};

use crate::context::HandlerContext;
use crate::dispatch::CmdSet;
use crate::error::NetError;
use crate::ids;
use crate::session::{Session, SessionRegistry};

/// Capacity of each connection's outbound channel.
pub const OUTBOUND_CAPACITY: usize = 16 * 1024;

/// A connection is considered dead if no traffic arrives within this
/// window.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping interval, derived from [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// How long an inbound service connection may take to present its
/// auth frame.
pub const AUTH_DEADLINE: Duration = Duration::from_secs(5);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// One queued outbound frame.
#[derive(Debug)]
pub struct OutFrame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Shared handle to a live connection.
///
/// Cloning is cheap; all clones refer to the same connection. The
/// outbound channel and closed flag are owned exclusively by the
/// connection and mutated only through [`Conn::write`] and
/// [`Conn::close`].
#[derive(Debug, Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

#[derive(Debug)]
struct ConnInner {
    id: u64,
    peer_addr: SocketAddr,
    outbound: mpsc::Sender<OutFrame>,
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

/// The receiving ends handed to whichever task drives the transport.
pub struct ConnDriver {
    pub outbound: mpsc::Receiver<OutFrame>,
    pub shutdown: broadcast::Receiver<()>,
}

impl Conn {
    /// Creates a connection handle and the driver for its writer task.
    ///
    /// Used directly by transports that bring their own writer (the
    /// gateway's WebSocket sink); TCP connections go through
    /// [`Conn::spawn_tcp`].
    pub fn channel(peer_addr: SocketAddr) -> (Conn, ConnDriver) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let conn = Conn {
            inner: Arc::new(ConnInner {
                id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                outbound: tx,
                closed: AtomicBool::new(false),
                shutdown: shutdown_tx,
            }),
        };
        let driver = ConnDriver {
            outbound: rx,
            shutdown: shutdown_rx,
        };
        (conn, driver)
    }

    /// Splits a TCP stream, spawns its writer task, and returns the
    /// handle plus the read half for the caller's read loop.
    pub fn spawn_tcp(stream: TcpStream) -> (Conn, OwnedReadHalf) {
        let peer_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();
        let (conn, driver) = Conn::channel(peer_addr);
        tokio::spawn(tcp_write_loop(write_half, driver, conn.clone()));
        (conn, read_half)
    }

    /// Process-unique connection id; registries use it to find the
    /// records bound to a connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Queues one frame without blocking.
    ///
    /// A full channel is [`NetError::WriteTooBusy`]; the caller
    /// decides whether to drop or retry. An oversized payload is
    /// [`NetError::TooLargeMessage`] and leaves the connection alive.
    pub fn write(&self, kind: FrameKind, payload: Vec<u8>) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        if payload.len() >= MAX_MESSAGE_SIZE {
            return Err(NetError::TooLargeMessage(payload.len()));
        }
        self.inner
            .outbound
            .try_send(OutFrame { kind, payload })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => NetError::WriteTooBusy,
                mpsc::error::TrySendError::Closed(_) => NetError::Closed,
            })
    }

    /// Awaiting variant of [`Conn::write`], reserved for tasks that
    /// own the only writer to this connection (client links' keepalive
    /// sender). Everything else must use the non-blocking `write`.
    pub async fn send(&self, kind: FrameKind, payload: Vec<u8>) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        if payload.len() >= MAX_MESSAGE_SIZE {
            return Err(NetError::TooLargeMessage(payload.len()));
        }
        self.inner
            .outbound
            .send(OutFrame { kind, payload })
            .await
            .map_err(|_| NetError::Closed)
    }

    /// Closes the connection. Idempotent: the closed flag is monotonic
    /// and the shutdown broadcast fires exactly once.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let _ = self.inner.shutdown.send(());
        }
    }

    /// Resolves once the connection is closed.
    ///
    /// Read loops select this against their blocking read so an
    /// explicit [`Conn::close`] tears the connection down immediately
    /// instead of waiting out a read deadline. Returns at once if the
    /// connection is already closed.
    pub async fn wait_closed(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        if self.is_closed() {
            return;
        }
        let _ = shutdown.recv().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Writer task for TCP connections.
///
/// Selects over the outbound channel, the heartbeat timer, and the
/// shutdown broadcast. The shutdown broadcast is the one mechanism
/// that unblocks a writer stuck in select.
async fn tcp_write_loop(mut writer: OwnedWriteHalf, mut driver: ConnDriver, conn: Conn) {
    let mut ping = interval(PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            frame = driver.outbound.recv() => {
                let Some(frame) = frame else { break };
                let bytes = match encode_frame(frame.kind, &frame.payload) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("dropping unencodable frame on {}: {err}", conn.peer_addr());
                        continue;
                    }
                };
                if let Err(err) = writer.write_all(&bytes).await {
                    debug!("write failed on {}: {err}", conn.peer_addr());
                    break;
                }
                if frame.kind == FrameKind::Close {
                    break;
                }
            }
            _ = ping.tick() => {
                let Ok(bytes) = encode_frame(FrameKind::Ping, &[]) else { break };
                if let Err(err) = writer.write_all(&bytes).await {
                    debug!("ping failed on {}: {err}", conn.peer_addr());
                    break;
                }
            }
            _ = driver.shutdown.recv() => {
                // Best-effort close frame; the peer may already be gone.
                if let Ok(bytes) = encode_frame(FrameKind::Close, &[]) {
                    let _ = writer.write_all(&bytes).await;
                }
                break;
            }
        }
    }

    conn.close();
    let _ = writer.shutdown().await;
}

/// Server side of the `Handshaking` phase.
///
/// The first frame on an inbound service connection must be an `Auth`
/// frame verified by the auth parser within [`AUTH_DEADLINE`].
/// Empty-body auth frames are pure heartbeats and keep the phase open
/// (each one restarts the deadline). Anything else fails the
/// handshake and the connection never reaches `Established`.
pub async fn authenticate(
    read_half: &mut OwnedReadHalf,
    auth: &SignParser,
) -> Result<Package, NetError> {
    loop {
        let (kind, payload) = timeout(AUTH_DEADLINE, read_frame(read_half))
            .await
            .map_err(|_| NetError::AuthTimeout)??;
        match kind {
            FrameKind::Auth if payload.is_empty() => continue,
            FrameKind::Auth => return Ok(auth.verify(&payload)?),
            _ => return Err(NetError::Protocol("expected auth frame")),
        }
    }
}

/// Serves one inbound service-to-service connection to completion.
///
/// Authenticates, registers a session, then decodes and dispatches
/// frames in arrival order. Application-level errors (unknown id, bad
/// body) are logged and scoped to the single message; transport-level
/// errors terminate the connection. On exit the session is removed and
/// a synthetic `FUNC_Close` flows through the normal dispatch path.
pub async fn serve_connection(
    stream: TcpStream,
    auth: Arc<SignParser>,
    signer: Arc<SignParser>,
    cmdset: Arc<CmdSet>,
    registry: Arc<SessionRegistry>,
) -> Result<(), NetError> {
    let (conn, mut read_half) = Conn::spawn_tcp(stream);
    let peer = conn.peer_addr();

    let hello = match authenticate(&mut read_half, &auth).await {
        Ok(package) => package,
        Err(err) => {
            debug!("handshake failed for {peer}: {err}");
            conn.close();
            return Err(err);
        }
    };

    let ssid = if hello.ssid.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        hello.ssid.clone()
    };
    registry.add(Session::new(ssid.clone(), conn.clone()));
    debug!("connection {peer} established, session {ssid}");

    let result = read_established(&mut read_half, &conn, &ssid, &signer, &cmdset).await;

    registry.remove(&ssid);
    conn.close();

    // Synthetic close notification through the normal dispatch path.
    let mut ctx = HandlerContext::new(ssid.clone(), Some(conn));
    ctx.package.server_name = hello.server_name;
    if let Err(err) = cmdset.handle(ctx, ids::FUNC_CLOSE, b"{}").await {
        debug!("close dispatch for session {ssid} failed: {err}");
    }

    result
}

async fn read_established(
    read_half: &mut OwnedReadHalf,
    conn: &Conn,
    ssid: &str,
    signer: &SignParser,
    cmdset: &CmdSet,
) -> Result<(), NetError> {
    loop {
        let frame = tokio::select! {
            frame = read_frame(read_half) => frame,
            _ = conn.wait_closed() => return Ok(()),
        };
        let (kind, payload) = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!("read failed on {}: {err}", conn.peer_addr());
                return Err(err.into());
            }
        };
        match kind {
            FrameKind::Raw => {
                let package = match signer.verify(&payload) {
                    Ok(package) => package,
                    Err(err) => {
                        // Signature failures are fatal: the stream is
                        // not trustworthy past this point.
                        warn!("signature failure on {}: {err}", conn.peer_addr());
                        return Err(err.into());
                    }
                };
                let id = package.id.clone();
                let body = package.data_bytes().to_vec();
                let mut ctx = HandlerContext::new(ssid.to_string(), Some(conn.clone()));
                ctx.package = package;
                match cmdset.handle(ctx, &id, &body).await {
                    Ok(()) => {}
                    Err(err @ (NetError::InvalidMessageId(_) | NetError::Json(_))) => {
                        // Scoped to this message; the connection lives on.
                        warn!("dispatch of '{id}' from {} failed: {err}", conn.peer_addr());
                    }
                    Err(err) => return Err(err),
                }
            }
            FrameKind::Auth => {
                // Re-auth or heartbeat after establishment; ignored.
            }
            FrameKind::Ping => {
                let _ = conn.write(FrameKind::Pong, Vec::new());
            }
            FrameKind::Pong => {}
            FrameKind::Close => return Ok(()),
        }
    }
}
