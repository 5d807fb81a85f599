//! Gateway configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use cluster_core::balance::TieBreak;

use crate::director::RateAction;
use crate::error::GatewayError;

/// Application configuration loaded from TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener configuration
    pub server: ServerSettings,
    /// Cluster signing and routing configuration
    pub cluster: ClusterSettings,
    /// Client rate-limit configuration
    pub rate_limit: RateLimitSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind address for client WebSocket connections
    pub bind_address: String,
    /// Address other processes reach this gateway on; registered with
    /// the router and handed out to new clients
    pub advertise_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Name this gateway registers under
    pub gateway_name: String,
    /// Router address; process configuration, never discovered
    pub router_address: String,
    /// Shared key for service-to-service envelope signatures
    pub service_key: String,
    /// Shared key for client envelope signatures
    pub client_key: String,
    /// Shared key for handshake auth frames
    pub auth_key: String,
    /// Tie-break rule among equal-weight backend candidates
    #[serde(default)]
    pub tie_break: TieBreak,
    /// Seconds between weight reports to the router
    pub report_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Messages allowed per rolling window; 0 disables limiting
    pub messages_per_window: u32,
    /// What happens to clients that exceed the limit
    #[serde(default)]
    pub action: RateAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter
    pub level: String,
    /// JSON formatting
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_address: "0.0.0.0:9000".to_string(),
                advertise_address: "127.0.0.1:9000".to_string(),
            },
            cluster: ClusterSettings {
                gateway_name: "gateway".to_string(),
                router_address: "127.0.0.1:7100".to_string(),
                service_key: "change-me-service".to_string(),
                client_key: "change-me-client".to_string(),
                auth_key: "change-me-auth".to_string(),
                tie_break: TieBreak::default(),
                report_interval: 10,
            },
            rate_limit: RateLimitSettings {
                messages_per_window: 60,
                action: RateAction::Delay,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from file, writing the default first if the
    /// file does not exist yet.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, GatewayError> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig =
                toml::from_str(&content).map_err(|e| GatewayError::Config(e.to_string()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)
                .map_err(|e| GatewayError::Config(e.to_string()))?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (label, addr) in [
            ("bind address", &self.server.bind_address),
            ("advertise address", &self.server.advertise_address),
            ("router address", &self.cluster.router_address),
        ] {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(format!("Invalid {label}: {addr}"));
            }
        }

        if self.cluster.gateway_name.is_empty() {
            return Err("cluster.gateway_name cannot be empty".to_string());
        }
        for (label, key) in [
            ("cluster.service_key", &self.cluster.service_key),
            ("cluster.client_key", &self.cluster.client_key),
            ("cluster.auth_key", &self.cluster.auth_key),
        ] {
            if key.is_empty() {
                return Err(format!("{label} cannot be empty"));
            }
        }
        if self.cluster.report_interval == 0 {
            return Err("cluster.report_interval must be positive".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            ));
        }

        Ok(())
    }
}
