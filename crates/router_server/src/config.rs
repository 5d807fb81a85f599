//! Router configuration.
//!
//! Loaded from a TOML file; a missing file is replaced by a written
//! default so a fresh deployment starts with a config it can edit.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use cluster_core::balance::TieBreak;

use crate::error::RouterError;

/// Application configuration loaded from TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener configuration
    pub server: ServerSettings,
    /// Cluster signing and balancing configuration
    pub cluster: ClusterSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind address for inbound service connections
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Shared key for service-to-service envelope signatures
    pub service_key: String,
    /// Shared key for handshake auth frames
    pub auth_key: String,
    /// Tie-break rule when gateways report equal weights
    #[serde(default)]
    pub tie_break: TieBreak,
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
                bind_address: "127.0.0.1:7100".to_string(),
            },
            cluster: ClusterSettings {
                service_key: "change-me-service".to_string(),
                auth_key: "change-me-auth".to_string(),
                tie_break: TieBreak::default(),
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
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, RouterError> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig =
                toml::from_str(&content).map_err(|e| RouterError::Config(e.to_string()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)
                .map_err(|e| RouterError::Config(e.to_string()))?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self
            .server
            .bind_address
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(format!(
                "Invalid bind address: {}",
                self.server.bind_address
            ));
        }

        if self.cluster.service_key.is_empty() {
            return Err("cluster.service_key cannot be empty".to_string());
        }
        if self.cluster.auth_key.is_empty() {
            return Err("cluster.auth_key cannot be empty".to_string());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut config = AppConfig::default();
        config.server.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());

        config.server.bind_address = "0.0.0.0:7100".to_string();
        config.cluster.service_key.clear();
        assert!(config.validate().is_err());

        config.cluster.service_key = "k".to_string();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn tie_break_round_trips_through_toml() {
        let mut config = AppConfig::default();
        config.cluster.tie_break = TieBreak::HighestKey;
        let text = toml::to_string_pretty(&config).unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.cluster.tie_break, TieBreak::HighestKey);
    }
}
