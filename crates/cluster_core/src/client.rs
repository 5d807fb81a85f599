//! Outbound service links.
//!
//! A process keeps one long-lived connection per remote service it
//! talks to. Each link runs its own reconnect state machine
//! (`Disconnected → Resolving → Dialing → Connected → …`) in the
//! background: addresses are re-resolved through the router on every
//! attempt, dial failures back off on a fixed schedule, and the first
//! frame after every successful dial is an auth-signed `Auth`
//! envelope carrying the current timestamp.
//!
//! Registration with the router is not durable server-side, so links
//! expose an `on_connect` callback that fires after every (re)connect;
//! processes use it to re-announce themselves.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use wire_proto::{
    current_timestamp, read_frame, write_frame, FrameKind, Package, SignParser,
};

use crate::conn::Conn;
use crate::error::NetError;
use crate::ids;

/// Reconnect backoff schedule; the retry count indexes into it and
/// clamps to the last entry.
pub const BACKOFF_MS: [u64; 5] = [100, 400, 1600, 3200, 5000];

/// Delay before the `retries`-th reconnect attempt.
pub fn backoff_delay(retries: usize) -> Duration {
    Duration::from_millis(BACKOFF_MS[retries.min(BACKOFF_MS.len() - 1)])
}

/// Resolves a service name to a dialable address; backed by the
/// router in production, by fixtures in tests.
#[async_trait]
pub trait AddrResolver: Send + Sync {
    async fn resolve(&self, service: &str) -> Option<String>;
}

/// Receives verified envelopes arriving on an outbound link.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_package(&self, service: &str, package: Package);
}

/// Link state, advanced only by the link's own background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Resolving,
    Dialing,
    Connected,
}

/// At most one [`ClientLink`] per distinct remote service name.
///
/// `get_or_connect` is create-or-join: when two callers race for the
/// same unregistered name, exactly one link (and one dial loop) is
/// created and both callers share it.
pub struct ClientPool {
    local_name: String,
    links: DashMap<String, Arc<ClientLink>>,
    resolver: Arc<dyn AddrResolver>,
    inbound: Arc<dyn InboundHandler>,
    auth: Arc<SignParser>,
    signer: Arc<SignParser>,
}

impl ClientPool {
    pub fn new(
        local_name: impl Into<String>,
        resolver: Arc<dyn AddrResolver>,
        inbound: Arc<dyn InboundHandler>,
        auth: Arc<SignParser>,
        signer: Arc<SignParser>,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            links: DashMap::new(),
            resolver,
            inbound,
            auth,
            signer,
        }
    }

    /// Returns the link for `service`, creating and starting it if
    /// this is the first request for that name.
    pub fn get_or_connect(&self, service: &str) -> Arc<ClientLink> {
        self.links
            .entry(service.to_string())
            .or_insert_with(|| self.start_link(service, None))
            .clone()
    }

    /// Creates a link with a fixed address from configuration; used
    /// for the router itself, whose address is never discovered.
    pub fn add_fixed(&self, service: &str, addr: &str) -> Arc<ClientLink> {
        self.links
            .entry(service.to_string())
            .or_insert_with(|| self.start_link(service, Some(addr.to_string())))
            .clone()
    }

    fn start_link(&self, service: &str, fixed_addr: Option<String>) -> Arc<ClientLink> {
        let link = Arc::new(ClientLink::new(service.to_string(), fixed_addr));
        ClientLink::start(
            link.clone(),
            self.local_name.clone(),
            self.resolver.clone(),
            self.inbound.clone(),
            self.auth.clone(),
            self.signer.clone(),
        );
        link
    }

    /// Link for `service` if one exists, without creating it.
    pub fn get(&self, service: &str) -> Option<Arc<ClientLink>> {
        self.links.get(service).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Fire-and-forget envelope to a named service. Encoding or
    /// signing failures are logged and dropped; callers needing a
    /// response use [`request`].
    pub fn route<T: Serialize>(&self, service: &str, msg_id: &str, body: &T) {
        let package = match Package::with_body(msg_id, body) {
            Ok(package) => package,
            Err(err) => {
                debug!("dropping '{msg_id}' to '{service}': {err}");
                return;
            }
        };
        self.route_package(service, package);
    }

    /// Fire-and-forget for a pre-built envelope; used when forwarding
    /// on behalf of a session (the caller sets `Ssid`/`ClientAddr`).
    pub fn route_package(&self, service: &str, mut package: Package) {
        package.server_name = self.local_name.clone();
        let buf = match self.signer.sign(&mut package) {
            Ok(buf) => buf,
            Err(err) => {
                debug!("dropping '{}' to '{service}': {err}", package.id);
                return;
            }
        };
        let link = self.get_or_connect(service);
        if let Err(err) = link.write_raw(buf) {
            debug!("dropping '{}' to '{service}': {err}", package.id);
        }
    }

    /// Stops every link and drops the pool's entries.
    pub fn shutdown(&self) {
        for entry in self.links.iter() {
            entry.stop();
        }
        self.links.clear();
    }
}

/// One long-lived outbound connection to a named service.
pub struct ClientLink {
    service: String,
    fixed_addr: Option<String>,
    state: Mutex<LinkState>,
    conn: RwLock<Option<Conn>>,
    on_connect: RwLock<Option<Arc<dyn Fn(&Conn) + Send + Sync>>>,
    dial_attempts: AtomicU64,
    stopped: AtomicBool,
}

impl ClientLink {
    fn new(service: String, fixed_addr: Option<String>) -> Self {
        Self {
            service,
            fixed_addr,
            state: Mutex::new(LinkState::Disconnected),
            conn: RwLock::new(None),
            on_connect: RwLock::new(None),
            dial_attempts: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Total dial attempts; diagnostics only.
    pub fn dial_attempts(&self) -> u64 {
        self.dial_attempts.load(Ordering::SeqCst)
    }

    /// Registers a callback fired after every successful connect,
    /// once the auth frame is on the wire. Router links use this to
    /// re-announce registration after each reconnect.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(&Conn) + Send + Sync + 'static,
    {
        *self.on_connect.write().unwrap() = Some(Arc::new(callback));
    }

    /// Queues a pre-signed buffer as a `Raw` frame.
    pub fn write_raw(&self, buf: Vec<u8>) -> Result<(), NetError> {
        let conn = self.conn.read().unwrap().clone();
        match conn {
            Some(conn) => conn.write(FrameKind::Raw, buf),
            None => Err(NetError::NotConnected(self.service.clone())),
        }
    }

    /// Stops the background loop and closes the current connection.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(conn) = self.conn.read().unwrap().clone() {
            conn.close();
        }
    }

    fn set_state(&self, state: LinkState) {
        *self.state.lock().unwrap() = state;
    }

    fn start(
        link: Arc<Self>,
        local_name: String,
        resolver: Arc<dyn AddrResolver>,
        inbound: Arc<dyn InboundHandler>,
        auth: Arc<SignParser>,
        signer: Arc<SignParser>,
    ) {
        tokio::spawn(async move {
            link.run(local_name, resolver, inbound, auth, signer).await;
        });
    }

    async fn run(
        self: Arc<Self>,
        local_name: String,
        resolver: Arc<dyn AddrResolver>,
        inbound: Arc<dyn InboundHandler>,
        auth: Arc<SignParser>,
        signer: Arc<SignParser>,
    ) {
        let mut retries = 0usize;
        while !self.stopped.load(Ordering::SeqCst) {
            self.set_state(LinkState::Resolving);
            let addr = match &self.fixed_addr {
                Some(addr) => Some(addr.clone()),
                None => resolver.resolve(&self.service).await,
            };
            let Some(addr) = addr else {
                debug!("no address for '{}' yet", self.service);
                sleep(backoff_delay(retries)).await;
                retries += 1;
                continue;
            };

            self.set_state(LinkState::Dialing);
            self.dial_attempts.fetch_add(1, Ordering::SeqCst);
            let stream = match TcpStream::connect(&addr).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("dial '{}' at {addr} failed: {err}", self.service);
                    self.set_state(LinkState::Disconnected);
                    sleep(backoff_delay(retries)).await;
                    retries += 1;
                    continue;
                }
            };
            retries = 0;

            let (conn, mut read_half) = Conn::spawn_tcp(stream);

            // The peer's handshake requires an auth envelope first.
            let mut hello = Package::new(ids::AUTH);
            hello.ts = current_timestamp();
            hello.server_name = local_name.clone();
            let authed = match auth.sign(&mut hello) {
                Ok(buf) => conn.send(FrameKind::Auth, buf).await.is_ok(),
                Err(err) => {
                    warn!("auth signing for '{}' failed: {err}", self.service);
                    false
                }
            };
            if !authed {
                conn.close();
                self.set_state(LinkState::Disconnected);
                sleep(backoff_delay(retries)).await;
                retries += 1;
                continue;
            }

            *self.conn.write().unwrap() = Some(conn.clone());
            self.set_state(LinkState::Connected);
            info!("🔗 link to '{}' established at {addr}", self.service);

            let callback = self.on_connect.read().unwrap().clone();
            if let Some(callback) = callback {
                callback(&conn);
            }

            self.read_until_closed(&conn, &mut read_half, &inbound, &signer)
                .await;

            conn.close();
            *self.conn.write().unwrap() = None;
            self.set_state(LinkState::Disconnected);
            if !self.stopped.load(Ordering::SeqCst) {
                warn!("🔌 link to '{}' lost; reconnecting", self.service);
            }
        }
    }

    async fn read_until_closed(
        &self,
        conn: &Conn,
        read_half: &mut tokio::net::tcp::OwnedReadHalf,
        inbound: &Arc<dyn InboundHandler>,
        signer: &SignParser,
    ) {
        loop {
            match read_frame(read_half).await {
                Ok((FrameKind::Raw, payload)) => match signer.verify(&payload) {
                    Ok(package) => inbound.on_package(&self.service, package).await,
                    Err(err) => {
                        warn!("bad envelope from '{}': {err}", self.service);
                        return;
                    }
                },
                Ok((FrameKind::Ping, _)) => {
                    let _ = conn.write(FrameKind::Pong, Vec::new());
                }
                Ok((FrameKind::Pong, _)) | Ok((FrameKind::Auth, _)) => {}
                Ok((FrameKind::Close, _)) => return,
                Err(err) => {
                    debug!("read on '{}' link failed: {err}", self.service);
                    return;
                }
            }
        }
    }
}

/// Synchronous request over a short-lived direct connection: dial,
/// auth, send one signed envelope, block for exactly one reply frame,
/// close.
pub async fn request(
    addr: &str,
    auth: &SignParser,
    signer: &SignParser,
    package: &mut Package,
) -> Result<Package, NetError> {
    let mut stream = TcpStream::connect(addr).await?;

    let mut hello = Package::new(ids::AUTH);
    hello.ts = current_timestamp();
    let buf = auth.sign(&mut hello)?;
    write_frame(&mut stream, FrameKind::Auth, &buf).await?;

    let buf = signer.sign(package)?;
    write_frame(&mut stream, FrameKind::Raw, &buf).await?;

    loop {
        let (kind, payload) = read_frame(&mut stream).await?;
        match kind {
            FrameKind::Raw => {
                let reply = signer.verify(&payload)?;
                let _ = write_frame(&mut stream, FrameKind::Close, &[]).await;
                return Ok(reply);
            }
            FrameKind::Ping => {
                write_frame(&mut stream, FrameKind::Pong, &[]).await?;
            }
            FrameKind::Close => return Err(NetError::Closed),
            FrameKind::Pong | FrameKind::Auth => {}
        }
    }
}
