//! Gateway service: client listener, router link, and forwarding.
//!
//! Clients connect over WebSocket and speak client-signed envelopes;
//! backends and the router speak service-signed envelopes over TCP.
//! The gateway sits between the two, verifying the client signature,
//! resolving the target instance per session, re-signing, and
//! forwarding. Replies from backends carry the originating `Ssid`
//! and are re-signed for the client on the way back out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wire_proto::{FrameKind, Package, SignParser};

use cluster_core::client::{AddrResolver, ClientPool, InboundHandler};
use cluster_core::conn::{Conn, AUTH_DEADLINE};
use cluster_core::error::NetError;
use cluster_core::ids;
use cluster_core::protocol::{ConcurrentArgs, RegisterArgs, ServiceNotice, UnavailableNotice};
use cluster_core::session::{Session, SessionRegistry};

use crate::config::AppConfig;
use crate::director::{RateAction, RateLimiter, SessionDirector};
use crate::directory::ServiceDirectory;
use crate::error::GatewayError;
use crate::ws::{self, WsReader};

/// Name the router link is pooled under.
const ROUTER_SERVICE: &str = "router";

/// Resolves backend names from the pushed directory; the router link
/// itself is fixed-address and never goes through here.
struct DirectoryResolver {
    directory: Arc<ServiceDirectory>,
}

#[async_trait]
impl AddrResolver for DirectoryResolver {
    async fn resolve(&self, service: &str) -> Option<String> {
        self.directory.addr_of(service)
    }
}

/// Handles envelopes arriving on outbound links: directory notices
/// from the router, everything else is a reply bound for a client
/// session.
struct GatewayInbound {
    directory: Arc<ServiceDirectory>,
    registry: Arc<SessionRegistry>,
    client_signer: Arc<SignParser>,
}

#[async_trait]
impl InboundHandler for GatewayInbound {
    async fn on_package(&self, service: &str, package: Package) {
        match package.id.as_str() {
            ids::S2C_SERVER_AVAILABLE => {
                match serde_json::from_slice::<ServiceNotice>(package.data_bytes()) {
                    Ok(notice) => self.directory.apply_available(notice),
                    Err(err) => warn!("bad directory notice from {service}: {err}"),
                }
            }
            ids::S2C_SERVER_UNAVAILABLE => {
                match serde_json::from_slice::<UnavailableNotice>(package.data_bytes()) {
                    Ok(notice) => self.directory.apply_unavailable(&notice.server_name),
                    Err(err) => warn!("bad directory notice from {service}: {err}"),
                }
            }
            _ => {
                if package.ssid.is_empty() {
                    debug!("dropping '{}' from {service}: no session id", package.id);
                    return;
                }
                let ssid = package.ssid.clone();
                let mut reply = package;
                // The session id is transport state, not part of the
                // client-visible envelope.
                reply.ssid = String::new();
                reply.server_name = String::new();
                let buf = match self.client_signer.sign(&mut reply) {
                    Ok(buf) => buf,
                    Err(err) => {
                        warn!("cannot re-sign '{}' for client: {err}", reply.id);
                        return;
                    }
                };
                if let Err(err) = self.registry.send_to(&ssid, FrameKind::Raw, buf) {
                    debug!("reply '{}' to session {ssid} dropped: {err}", reply.id);
                }
            }
        }
    }
}

pub struct GatewayService {
    config: AppConfig,
    directory: Arc<ServiceDirectory>,
    director: Arc<SessionDirector>,
    registry: Arc<SessionRegistry>,
    pool: Arc<ClientPool>,
    auth: Arc<SignParser>,
    client_signer: Arc<SignParser>,
    shutdown: broadcast::Sender<()>,
}

impl GatewayService {
    pub fn new(config: AppConfig) -> Arc<Self> {
        let directory = Arc::new(ServiceDirectory::new());
        let director = Arc::new(SessionDirector::new(
            directory.clone(),
            config.cluster.tie_break,
        ));
        let registry = Arc::new(SessionRegistry::new());
        let auth = Arc::new(SignParser::auth(&config.cluster.auth_key));
        let client_signer = Arc::new(SignParser::client(&config.cluster.client_key));
        let service_signer = Arc::new(SignParser::service(&config.cluster.service_key));

        let pool = Arc::new(ClientPool::new(
            config.cluster.gateway_name.clone(),
            Arc::new(DirectoryResolver {
                directory: directory.clone(),
            }),
            Arc::new(GatewayInbound {
                directory: directory.clone(),
                registry: registry.clone(),
                client_signer: client_signer.clone(),
            }),
            auth.clone(),
            service_signer.clone(),
        ));
        let (shutdown, _) = broadcast::channel(1);

        Arc::new(Self {
            config,
            directory,
            director,
            registry,
            pool,
            auth,
            client_signer,
            shutdown,
        })
    }

    pub fn directory(&self) -> &Arc<ServiceDirectory> {
        &self.directory
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Starts the router link. Registration is not durable on the
    /// router, so it is re-announced after every reconnect.
    fn connect_router(self: &Arc<Self>) {
        let link = self
            .pool
            .add_fixed(ROUTER_SERVICE, &self.config.cluster.router_address);

        let name = self.config.cluster.gateway_name.clone();
        let addr = self.config.server.advertise_address.clone();
        let registry = self.registry.clone();
        let signer = Arc::new(SignParser::service(&self.config.cluster.service_key));
        link.on_connect(move |conn: &Conn| {
            let args = RegisterArgs {
                name: name.clone(),
                addr: addr.clone(),
                weight: registry.len() as i32,
                min_weight: 0,
                max_weight: 0,
                is_gateway: true,
            };
            let mut package = match Package::with_body(ids::REGISTER, &args) {
                Ok(package) => package,
                Err(err) => {
                    warn!("cannot encode registration: {err}");
                    return;
                }
            };
            package.server_name = name.clone();
            match signer.sign(&mut package) {
                Ok(buf) => {
                    if let Err(err) = conn.write(FrameKind::Raw, buf) {
                        warn!("registration write failed: {err}");
                    } else {
                        info!("📇 registered with router as '{name}' ({addr})");
                    }
                }
                Err(err) => warn!("cannot sign registration: {err}"),
            }
        });
    }

    /// Runs the client listener and the weight-report timer until
    /// shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), GatewayError> {
        self.connect_router();

        let listener = TcpListener::bind(&self.config.server.bind_address).await?;
        info!(
            "🌐 Gateway listening on {} (advertised as {})",
            self.config.server.bind_address, self.config.server.advertise_address
        );

        let mut report = interval(Duration::from_secs(self.config.cluster.report_interval));
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        report.reset();

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            error!("accept failed: {err}");
                            continue;
                        }
                    };
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = service.serve_client(stream, peer).await {
                            debug!("client {peer} ended: {err}");
                        }
                    });
                }
                _ = report.tick() => {
                    let weight = self.registry.len() as i32;
                    self.pool.route(ROUTER_SERVICE, ids::CONCURRENT, &ConcurrentArgs { weight });
                    debug!("reported weight {weight} to router");
                }
                _ = shutdown.recv() => break,
            }
        }

        self.registry.close_all();
        self.pool.shutdown();
        info!("✅ Gateway stopped");
        Ok(())
    }

    /// Signals shutdown; `run` returns shortly after.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Serves one client WebSocket connection to completion.
    async fn serve_client(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), GatewayError> {
        let (conn, mut reader) = ws::accept(stream, peer).await?;

        let hello = match self.handshake(&mut reader).await {
            Ok(package) => package,
            Err(err) => {
                debug!("client handshake failed for {peer}: {err}");
                conn.close();
                return Err(err);
            }
        };
        let ssid = if hello.ssid.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            hello.ssid.clone()
        };
        self.registry.add(Session::new(ssid.clone(), conn.clone()));
        info!("🎮 client {peer} connected, session {ssid}");

        let result = self.read_client(&mut reader, &conn, &ssid, peer).await;

        self.registry.remove(&ssid);
        self.director.remove_session(&ssid);
        conn.close();
        info!("👋 client {peer} disconnected, session {ssid}");
        result
    }

    /// Client side of the handshake phase: an auth-signed envelope
    /// within the deadline, with empty auth frames as heartbeats.
    async fn handshake(&self, reader: &mut WsReader) -> Result<Package, GatewayError> {
        loop {
            let (kind, payload) = timeout(AUTH_DEADLINE, reader.next_frame())
                .await
                .map_err(|_| GatewayError::Net(NetError::AuthTimeout))??;
            match kind {
                FrameKind::Auth if payload.is_empty() => continue,
                FrameKind::Auth => return Ok(self.auth.verify(&payload)?),
                _ => return Err(NetError::Protocol("expected auth frame").into()),
            }
        }
    }

    async fn read_client(
        self: &Arc<Self>,
        reader: &mut WsReader,
        conn: &Conn,
        ssid: &str,
        peer: SocketAddr,
    ) -> Result<(), GatewayError> {
        let mut limiter = RateLimiter::new(
            self.config.rate_limit.messages_per_window,
            self.config.rate_limit.action,
        );

        loop {
            let (kind, payload) = tokio::select! {
                frame = reader.next_frame() => frame?,
                // An explicit close (FUNC_Close handler, shutdown)
                // must tear the session down immediately, not after
                // the read deadline.
                _ = conn.wait_closed() => return Ok(()),
            };
            match kind {
                FrameKind::Raw => {
                    match limiter.admit(Instant::now()) {
                        Some(RateAction::Disconnect) => {
                            warn!("disconnecting {peer}: rate limit exceeded");
                            return Err(GatewayError::RateLimited);
                        }
                        Some(RateAction::Delay) => {
                            let pause = limiter.window_remaining(Instant::now());
                            debug!("throttling {peer} for {pause:?}");
                            tokio::time::sleep(pause).await;
                        }
                        None => {}
                    }

                    let package = match self.client_signer.verify(&payload) {
                        Ok(package) => package,
                        Err(err) => {
                            // A bad client signature means the stream
                            // is not trustworthy past this point.
                            warn!("client signature failure on {peer}: {err}");
                            return Err(err.into());
                        }
                    };
                    if let Err(err) = self.dispatch_client(conn, ssid, peer, package) {
                        // Scoped to the one frame; the session lives on.
                        debug!("dispatch from session {ssid} failed: {err}");
                    }
                }
                FrameKind::Ping => {
                    let _ = conn.write(FrameKind::Pong, Vec::new());
                }
                FrameKind::Pong | FrameKind::Auth => {}
                FrameKind::Close => return Ok(()),
            }
        }
    }

    /// Routes one verified client envelope: dotted ids go to the
    /// matched backend, bare ids are gateway-local. A dotted id with
    /// no live instance notifies the client and fails with
    /// [`GatewayError::NoServer`]; the frame itself is dropped.
    fn dispatch_client(
        &self,
        conn: &Conn,
        ssid: &str,
        peer: SocketAddr,
        package: Package,
    ) -> Result<(), GatewayError> {
        let target = ids::split_target(&package.id).map(|(server, _)| server.to_string());
        if let Some(server_name) = target {
            let Some(entry) = self.director.match_best_server(ssid, &server_name) else {
                self.notify_unavailable(conn, &server_name);
                return Err(GatewayError::NoServer(server_name));
            };
            let mut forwarded = package;
            forwarded.ssid = ssid.to_string();
            forwarded.client_addr = peer.to_string();
            forwarded.sign = String::new();
            self.pool.route_package(&entry.name, forwarded);
            return Ok(());
        }

        match package.id.as_str() {
            ids::HEART_BEAT => {
                let mut echo = Package::new(ids::HEART_BEAT);
                match self.client_signer.sign(&mut echo) {
                    Ok(buf) => {
                        let _ = conn.write(FrameKind::Raw, buf);
                    }
                    Err(err) => warn!("cannot sign heartbeat echo: {err}"),
                }
            }
            ids::FUNC_CLOSE => conn.close(),
            other => debug!("unknown local id '{other}' from session {ssid}"),
        }
        Ok(())
    }

    /// Client-visible notice that a targeted service has no live
    /// instance; the offending frame is dropped, never queued.
    fn notify_unavailable(&self, conn: &Conn, server_name: &str) {
        let notice = UnavailableNotice {
            server_name: server_name.to_string(),
        };
        let mut package = match Package::with_body(ids::S2C_SERVER_UNAVAILABLE, &notice) {
            Ok(package) => package,
            Err(err) => {
                warn!("cannot encode unavailable notice: {err}");
                return;
            }
        };
        match self.client_signer.sign(&mut package) {
            Ok(buf) => {
                let _ = conn.write(FrameKind::Raw, buf);
            }
            Err(err) => warn!("cannot sign unavailable notice: {err}"),
        }
    }
}
