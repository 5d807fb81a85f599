//! Router service: listener, dispatch bindings, and host loop.
//!
//! Every backend and gateway in the cluster keeps one TCP link to
//! this process. The router accepts those links, authenticates them,
//! and feeds their envelopes through a `CmdSet` whose handlers run on
//! the single queue consumer, so the tables never see concurrent
//! handler access.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::value::RawValue;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use wire_proto::SignParser;

use cluster_core::conn::serve_connection;
use cluster_core::dispatch::CmdSet;
use cluster_core::ids;
use cluster_core::protocol::{ConcurrentArgs, RegisterArgs};
use cluster_core::queue::{message_queue, QueueConsumer};
use cluster_core::session::SessionRegistry;

use crate::config::AppConfig;
use crate::error::RouterError;
use crate::table::{RouterTable, ServerRecord};

/// Router-local message ids.
pub const GET_GATEWAY: &str = "GetGateway";
pub const ROUTE_TO_SET: &str = "RouteToSet";
pub const S2C_GATEWAY_ADDR: &str = "S2C_GatewayAddr";

/// Fan-out request from a backend service.
#[derive(Debug, Deserialize)]
pub struct RouteToSetArgs {
    /// Comma-separated service names, or `"*"` for every service.
    #[serde(rename = "Names")]
    pub names: String,
    /// Message id to deliver under.
    #[serde(rename = "Id")]
    pub id: String,
    /// Body forwarded verbatim.
    #[serde(rename = "Data", default)]
    pub data: Option<Box<RawValue>>,
}

/// Reply to a [`GET_GATEWAY`] request.
#[derive(Debug, serde::Serialize, Deserialize)]
pub struct GatewayAddr {
    #[serde(rename = "Addr")]
    pub addr: String,
}

pub struct RouterService {
    config: AppConfig,
    table: Arc<RouterTable>,
    cmdset: Arc<CmdSet>,
    registry: Arc<SessionRegistry>,
    auth: Arc<SignParser>,
    signer: Arc<SignParser>,
    consumer: Mutex<Option<QueueConsumer>>,
    shutdown: broadcast::Sender<()>,
}

impl RouterService {
    pub async fn new(config: AppConfig) -> Arc<Self> {
        let (queue, consumer) = message_queue();
        let signer = Arc::new(SignParser::service(&config.cluster.service_key));
        let auth = Arc::new(SignParser::auth(&config.cluster.auth_key));
        let table = Arc::new(RouterTable::new(
            config.cluster.tie_break,
            signer.clone(),
        ));
        let (shutdown, _) = broadcast::channel(1);

        let service = Arc::new(Self {
            config,
            table,
            cmdset: Arc::new(CmdSet::new("router", queue)),
            registry: Arc::new(SessionRegistry::new()),
            auth,
            signer,
            consumer: Mutex::new(Some(consumer)),
            shutdown,
        });
        service.bind_handlers().await;
        service
    }

    pub fn table(&self) -> &Arc<RouterTable> {
        &self.table
    }

    async fn bind_handlers(self: &Arc<Self>) {
        let table = self.table.clone();
        self.cmdset
            .bind(ids::REGISTER, move |ctx, args: RegisterArgs| {
                let Some(conn) = ctx.conn.clone() else {
                    warn!("register without a live connection");
                    return;
                };
                table.register(ServerRecord::from_args(&args, conn));
            })
            .await;

        let table = self.table.clone();
        self.cmdset
            .bind(ids::CONCURRENT, move |ctx, args: ConcurrentArgs| {
                if let Some(conn) = &ctx.conn {
                    table.concurrent(conn.id(), args.weight);
                }
            })
            .await;

        let table = self.table.clone();
        let signer = self.signer.clone();
        self.cmdset
            .bind(GET_GATEWAY, move |ctx, _args: serde_json::Value| {
                match table.get_best_gateway() {
                    Some(addr) => ctx.reply(&signer, S2C_GATEWAY_ADDR, &GatewayAddr { addr }),
                    None => {
                        debug!("gateway lookup with no gateways registered");
                        ctx.reply(
                            &signer,
                            S2C_GATEWAY_ADDR,
                            &GatewayAddr {
                                addr: String::new(),
                            },
                        );
                    }
                }
            })
            .await;

        let table = self.table.clone();
        self.cmdset
            .bind(ROUTE_TO_SET, move |_ctx, args: RouteToSetArgs| {
                let body = match args.data {
                    Some(data) => data,
                    None => match RawValue::from_string("{}".to_string()) {
                        Ok(data) => data,
                        Err(err) => {
                            warn!("fan-out body encode failed: {err}");
                            return;
                        }
                    },
                };
                let delivered = table.route_to_set(&args.names, &args.id, &body);
                debug!("fan-out '{}' to '{}': {delivered} delivered", args.id, args.names);
            })
            .await;

        self.cmdset
            .bind(ids::HEART_BEAT, |ctx, _args: serde_json::Value| {
                debug!("heartbeat from session {}", ctx.ssid);
            })
            .await;

        let table = self.table.clone();
        self.cmdset
            .bind(ids::FUNC_CLOSE, move |ctx, _args: serde_json::Value| {
                if let Some(conn) = &ctx.conn {
                    table.remove(conn.id());
                }
            })
            .await;
    }

    /// Runs the listener and the queue consumer until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), RouterError> {
        let listener = TcpListener::bind(&self.config.server.bind_address).await?;
        info!("🌐 Router listening on {}", self.config.server.bind_address);

        let consumer_handle = {
            let mut consumer = self
                .consumer
                .lock()
                .await
                .take()
                .ok_or_else(|| RouterError::Config("router already running".to_string()))?;
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = consumer.run_once() => {}
                        _ = shutdown.recv() => {
                            let drained = consumer.drain().await;
                            if drained > 0 {
                                info!("drained {drained} queued messages on shutdown");
                            }
                            break;
                        }
                    }
                }
            })
        };

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
                    debug!("inbound connection from {peer}");
                    let auth = self.auth.clone();
                    let signer = self.signer.clone();
                    let cmdset = self.cmdset.clone();
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(err) =
                            serve_connection(stream, auth, signer, cmdset, registry).await
                        {
                            debug!("connection from {peer} ended: {err}");
                        }
                    });
                }
                _ = shutdown.recv() => break,
            }
        }

        self.registry.close_all();
        let _ = consumer_handle.await;
        info!("✅ Router stopped");
        Ok(())
    }

    /// Signals shutdown; `run` returns once in-flight work drains.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use wire_proto::{FrameKind, Package};

    use cluster_core::conn::Conn;
    use cluster_core::context::HandlerContext;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.server.bind_address = "127.0.0.1:0".to_string();
        config
    }

    async fn dispatch(
        service: &Arc<RouterService>,
        conn: Conn,
        id: &str,
        body: serde_json::Value,
    ) {
        let ctx = HandlerContext::new("test-session".to_string(), Some(conn));
        let raw = serde_json::to_vec(&body).unwrap();
        service.cmdset.handle(ctx, id, &raw).await.unwrap();
    }

    async fn run_queue(service: &Arc<RouterService>) {
        let mut consumer = service.consumer.lock().await.take().unwrap();
        consumer.drain().await;
        *service.consumer.lock().await = Some(consumer);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_flows_into_the_table() {
        let service = RouterService::new(test_config()).await;
        let (conn, _driver) = Conn::channel(SocketAddr::from(([127, 0, 0, 1], 0)));

        dispatch(
            &service,
            conn,
            ids::REGISTER,
            serde_json::json!({
                "Name": "room",
                "Addr": "10.0.0.2:7001",
                "Weight": 3,
            }),
        )
        .await;
        run_queue(&service).await;

        assert_eq!(
            service.table.get_server_addr("room"),
            Some("10.0.0.2:7001".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_removes_the_registration() {
        let service = RouterService::new(test_config()).await;
        let (conn, _driver) = Conn::channel(SocketAddr::from(([127, 0, 0, 1], 0)));

        dispatch(
            &service,
            conn.clone(),
            ids::REGISTER,
            serde_json::json!({"Name": "room", "Addr": "10.0.0.2:7001"}),
        )
        .await;
        dispatch(&service, conn, ids::FUNC_CLOSE, serde_json::json!({})).await;
        run_queue(&service).await;

        assert_eq!(service.table.get_server_addr("room"), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gateway_lookup_replies_with_the_least_loaded_address() {
        let service = RouterService::new(test_config()).await;
        let (gate_a, _drv_a) = Conn::channel(SocketAddr::from(([127, 0, 0, 1], 0)));
        let (gate_b, _drv_b) = Conn::channel(SocketAddr::from(([127, 0, 0, 1], 0)));
        dispatch(
            &service,
            gate_a,
            ids::REGISTER,
            serde_json::json!({
                "Name": "gate", "Addr": "10.0.0.10:9000", "Weight": 50, "IsGateway": true,
            }),
        )
        .await;
        dispatch(
            &service,
            gate_b,
            ids::REGISTER,
            serde_json::json!({
                "Name": "gate", "Addr": "10.0.0.11:9000", "Weight": 2, "IsGateway": true,
            }),
        )
        .await;

        let (caller, mut driver) = Conn::channel(SocketAddr::from(([127, 0, 0, 1], 0)));
        dispatch(&service, caller, GET_GATEWAY, serde_json::json!({})).await;
        run_queue(&service).await;

        let frame = driver.outbound.try_recv().expect("gateway reply");
        assert_eq!(frame.kind, FrameKind::Raw);
        let package: Package = service.signer.verify(&frame.payload).unwrap();
        assert_eq!(package.id, S2C_GATEWAY_ADDR);
        let reply: GatewayAddr = serde_json::from_slice(package.data_bytes()).unwrap();
        assert_eq!(reply.addr, "10.0.0.11:9000");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn weight_report_updates_the_registration() {
        let service = RouterService::new(test_config()).await;
        let (gate_a, _drv_a) = Conn::channel(SocketAddr::from(([127, 0, 0, 1], 0)));
        let (gate_b, _drv_b) = Conn::channel(SocketAddr::from(([127, 0, 0, 1], 0)));
        dispatch(
            &service,
            gate_a.clone(),
            ids::REGISTER,
            serde_json::json!({
                "Name": "gate", "Addr": "10.0.0.10:9000", "Weight": 1, "IsGateway": true,
            }),
        )
        .await;
        dispatch(
            &service,
            gate_b,
            ids::REGISTER,
            serde_json::json!({
                "Name": "gate", "Addr": "10.0.0.11:9000", "Weight": 5, "IsGateway": true,
            }),
        )
        .await;
        dispatch(
            &service,
            gate_a,
            ids::CONCURRENT,
            serde_json::json!({"Weight": 80}),
        )
        .await;
        run_queue(&service).await;

        assert_eq!(
            service.table.get_best_gateway(),
            Some("10.0.0.11:9000".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fan_out_reaches_the_named_services() {
        let service = RouterService::new(test_config()).await;
        let (room, mut room_driver) = Conn::channel(SocketAddr::from(([127, 0, 0, 1], 0)));
        dispatch(
            &service,
            room,
            ids::REGISTER,
            serde_json::json!({"Name": "room", "Addr": "10.0.0.2:7001"}),
        )
        .await;

        let (caller, _driver) = Conn::channel(SocketAddr::from(([127, 0, 0, 1], 0)));
        dispatch(
            &service,
            caller,
            ROUTE_TO_SET,
            serde_json::json!({
                "Names": "*",
                "Id": "S2C_Maintenance",
                "Data": {"at": 1700000000},
            }),
        )
        .await;
        run_queue(&service).await;

        let frame = room_driver.outbound.try_recv().expect("fan-out frame");
        let package = service.signer.verify(&frame.payload).unwrap();
        assert_eq!(package.id, "S2C_Maintenance");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listener_accepts_and_shuts_down() {
        let mut config = test_config();
        config.server.bind_address = "127.0.0.1:17311".to_string();
        let service = RouterService::new(config).await;

        let runner = {
            let service = service.clone();
            tokio::spawn(service.run())
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let stream = tokio::net::TcpStream::connect("127.0.0.1:17311").await;
        assert!(stream.is_ok());

        service.shutdown();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), runner)
            .await
            .expect("run should stop after shutdown")
            .expect("runner task");
        assert!(result.is_ok());
    }
}
