//! Per-message handler context.

use serde::Serialize;
use tracing::debug;
use wire_proto::{FrameKind, Package, SignParser};

use crate::conn::Conn;

/// Everything a handler may need about the message it is running for:
/// the originating session, the connection it arrived on, and the
/// decoded envelope. The hook can mark the context failed to
/// short-circuit the handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    /// Session id of the originating connection.
    pub ssid: String,
    /// The connection the message arrived on, when there is one
    /// (synthetic local messages may carry none).
    pub conn: Option<Conn>,
    /// The envelope as received.
    pub package: Package,
    failed: bool,
}

impl HandlerContext {
    pub fn new(ssid: String, conn: Option<Conn>) -> Self {
        Self {
            ssid,
            conn,
            package: Package::default(),
            failed: false,
        }
    }

    /// Marks the context failed; the queue consumer skips the handler
    /// for a context the hook failed.
    pub fn fail(&mut self) {
        self.failed = true;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Signs and queues a reply on the originating connection.
    /// Fire-and-forget: encode failures are logged and dropped.
    ///
    /// The reply carries the received envelope's `Ssid` when one was
    /// set, so a gateway relaying it can address the client session
    /// it belongs to.
    pub fn reply<T: Serialize>(&self, signer: &SignParser, id: &str, body: &T) {
        let Some(conn) = &self.conn else {
            debug!("no connection to reply '{id}' on");
            return;
        };
        let mut package = match Package::with_body(id, body) {
            Ok(package) => package,
            Err(err) => {
                debug!("dropping reply '{id}': {err}");
                return;
            }
        };
        package.ssid = if self.package.ssid.is_empty() {
            self.ssid.clone()
        } else {
            self.package.ssid.clone()
        };
        match signer.sign(&mut package) {
            Ok(buf) => {
                if let Err(err) = conn.write(FrameKind::Raw, buf) {
                    debug!("dropping reply '{id}': {err}");
                }
            }
            Err(err) => debug!("dropping reply '{id}': {err}"),
        }
    }
}
