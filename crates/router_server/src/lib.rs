//! Cluster router.
//!
//! Central registry of the cluster: backend services and gateways
//! register here over TCP, report their load periodically, and learn
//! about each other through pushed directory notices. The router
//! resolves service names to addresses, selects the least-loaded
//! gateway for new clients, and fans envelopes out to named service
//! sets.

pub mod config;
pub mod error;
pub mod service;
pub mod table;

pub use config::AppConfig;
pub use error::RouterError;
pub use service::RouterService;
pub use table::{RouterTable, ServerRecord};
