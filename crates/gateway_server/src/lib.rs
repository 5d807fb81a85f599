//! Cluster gateway.
//!
//! The client-facing edge of the cluster: accepts WebSocket
//! connections from game clients, verifies client-signed envelopes,
//! matches each session to a backend instance (sticky, load-aware),
//! and forwards traffic over pooled service links. The router pushes
//! the live service directory here, so target resolution never
//! blocks on a lookup round trip.

pub mod config;
pub mod director;
pub mod directory;
pub mod error;
pub mod service;
pub mod ws;

pub use config::AppConfig;
pub use director::{RateAction, RateLimiter, SessionDirector, SessionLocation};
pub use directory::{ServiceDirectory, ServiceEntry};
pub use error::GatewayError;
pub use service::GatewayService;
