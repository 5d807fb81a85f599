//! Live server and gateway tables.
//!
//! The router's view of the cluster: non-gateway services keyed by
//! name, gateway instances keyed by address, both guarded by
//! reader/writer locks (many concurrent routing lookups, exclusive
//! writer for register/remove). Gateways are push-fed: every
//! registration and weight change is forwarded to every live gateway
//! so their directory never polls.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};
use wire_proto::{FrameKind, Package, SignParser};

use cluster_core::balance::{pick_min_weight, TieBreak};
use cluster_core::conn::Conn;
use cluster_core::ids;
use cluster_core::protocol::{RegisterArgs, ServiceNotice, UnavailableNotice};

/// One registered service or gateway instance.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    /// Advertised name; may be a comma-separated list of logical
    /// names the instance serves.
    pub name: String,
    pub addr: String,
    pub weight: i32,
    pub min_weight: i32,
    pub max_weight: i32,
    pub is_gateway: bool,
    /// The registering connection; records die with it.
    pub conn: Conn,
}

impl ServerRecord {
    pub fn from_args(args: &RegisterArgs, conn: Conn) -> Self {
        Self {
            name: args.name.clone(),
            addr: args.addr.clone(),
            weight: args.weight,
            min_weight: args.min_weight,
            max_weight: args.max_weight,
            is_gateway: args.is_gateway,
            conn,
        }
    }

    fn notice(&self) -> ServiceNotice {
        ServiceNotice {
            name: self.name.clone(),
            addr: self.addr.clone(),
            weight: self.weight,
            min_weight: self.min_weight,
            max_weight: self.max_weight,
        }
    }
}

/// The router's registry of live backends and gateways.
pub struct RouterTable {
    services: RwLock<HashMap<String, ServerRecord>>,
    gateways: RwLock<HashMap<String, ServerRecord>>,
    tie_break: TieBreak,
    signer: Arc<SignParser>,
}

impl RouterTable {
    pub fn new(tie_break: TieBreak, signer: Arc<SignParser>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            gateways: RwLock::new(HashMap::new()),
            tie_break,
            signer,
        }
    }

    /// Inserts or replaces a record.
    ///
    /// A new service is announced to every live gateway; a new
    /// gateway receives the full current directory so it can resolve
    /// services that registered before it did.
    pub fn register(&self, record: ServerRecord) {
        if record.is_gateway {
            info!("🚪 gateway registered: {} ({})", record.name, record.addr);
            let directory: Vec<ServiceNotice> = {
                let services = self.services.read().unwrap();
                let mut names: Vec<_> = services.keys().cloned().collect();
                names.sort();
                names.iter().map(|name| services[name].notice()).collect()
            };
            for notice in directory {
                self.push(&record.conn, ids::S2C_SERVER_AVAILABLE, &notice);
            }
            self.gateways
                .write()
                .unwrap()
                .insert(record.addr.clone(), record);
        } else {
            info!("📡 service registered: {} ({})", record.name, record.addr);
            let notice = record.notice();
            self.services
                .write()
                .unwrap()
                .insert(record.name.clone(), record);
            self.notify_gateways(ids::S2C_SERVER_AVAILABLE, &notice);
        }
    }

    /// Pure lookup; `None` means no instance known.
    pub fn get_server_addr(&self, name: &str) -> Option<String> {
        self.services
            .read()
            .unwrap()
            .get(name)
            .map(|record| record.addr.clone())
    }

    /// Address of the gateway with minimum reported weight, for
    /// handing new clients to the least-loaded instance. Ties are
    /// broken by the configured [`TieBreak`] over sorted addresses.
    pub fn get_best_gateway(&self) -> Option<String> {
        let gateways = self.gateways.read().unwrap();
        let candidates: Vec<(String, i32)> = gateways
            .values()
            .map(|record| (record.addr.clone(), record.weight))
            .collect();
        pick_min_weight(candidates, self.tie_break)
    }

    /// Updates the weight of whichever live record reported it,
    /// identified by the reporting connection. Weight changes on
    /// services are re-pushed to gateways.
    pub fn concurrent(&self, conn_id: u64, weight: i32) {
        {
            let mut gateways = self.gateways.write().unwrap();
            if let Some(record) = gateways.values_mut().find(|r| r.conn.id() == conn_id) {
                record.weight = weight;
                return;
            }
        }
        let notice = {
            let mut services = self.services.write().unwrap();
            match services.values_mut().find(|r| r.conn.id() == conn_id) {
                Some(record) => {
                    record.weight = weight;
                    Some(record.notice())
                }
                None => None,
            }
        };
        match notice {
            Some(notice) => self.notify_gateways(ids::S2C_SERVER_AVAILABLE, &notice),
            None => debug!("weight report from unknown connection {conn_id}"),
        }
    }

    /// Deletes any record bound to the closing connection; wired to
    /// the `FUNC_Close` dispatch path. Gateways are told which
    /// service names went away.
    pub fn remove(&self, conn_id: u64) {
        let removed_services: Vec<String> = {
            let mut services = self.services.write().unwrap();
            let names: Vec<String> = services
                .iter()
                .filter(|(_, r)| r.conn.id() == conn_id)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                services.remove(name);
            }
            names
        };
        for name in &removed_services {
            info!("📴 service gone: {name}");
            self.notify_gateways(
                ids::S2C_SERVER_UNAVAILABLE,
                &UnavailableNotice {
                    server_name: name.clone(),
                },
            );
        }

        let mut gateways = self.gateways.write().unwrap();
        let gone: Vec<String> = gateways
            .iter()
            .filter(|(_, r)| r.conn.id() == conn_id)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in gone {
            info!("📴 gateway gone: {addr}");
            gateways.remove(&addr);
        }
    }

    /// Fans one envelope out to every name in the comma-separated
    /// set; `"*"` targets every currently-registered non-gateway
    /// service. Returns how many deliveries were queued.
    pub fn route_to_set<T: Serialize>(&self, names: &str, msg_id: &str, body: &T) -> usize {
        let services = self.services.read().unwrap();
        let mut targets: Vec<&ServerRecord> = if names == "*" {
            let mut keys: Vec<_> = services.keys().collect();
            keys.sort();
            keys.into_iter().map(|k| &services[k]).collect()
        } else {
            let mut listed: Vec<&str> = names.split(',').map(str::trim).collect();
            listed.sort_unstable();
            listed
                .into_iter()
                .filter_map(|name| services.get(name))
                .collect()
        };
        targets.dedup_by(|a, b| a.conn.id() == b.conn.id() && a.name == b.name);

        let mut delivered = 0;
        for record in targets {
            if self.push(&record.conn, msg_id, body) {
                delivered += 1;
            }
        }
        delivered
    }

    /// [`Self::route_to_set`] with the `"*"` target set.
    pub fn broadcast<T: Serialize>(&self, msg_id: &str, body: &T) -> usize {
        self.route_to_set("*", msg_id, body)
    }

    /// Registered non-gateway service names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered gateway addresses, sorted.
    pub fn gateway_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<_> = self.gateways.read().unwrap().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    fn notify_gateways<T: Serialize>(&self, msg_id: &str, body: &T) {
        let gateways = self.gateways.read().unwrap();
        let mut addrs: Vec<_> = gateways.keys().collect();
        addrs.sort();
        for addr in addrs {
            self.push(&gateways[addr].conn, msg_id, body);
        }
    }

    fn push<T: Serialize>(&self, conn: &Conn, msg_id: &str, body: &T) -> bool {
        let mut package = match Package::with_body(msg_id, body) {
            Ok(package) => package,
            Err(err) => {
                warn!("cannot encode '{msg_id}': {err}");
                return false;
            }
        };
        match self.signer.sign(&mut package) {
            Ok(buf) => match conn.write(FrameKind::Raw, buf) {
                Ok(()) => true,
                Err(err) => {
                    debug!("push '{msg_id}' failed: {err}");
                    false
                }
            },
            Err(err) => {
                warn!("cannot sign '{msg_id}': {err}");
                false
            }
        }
    }
}
