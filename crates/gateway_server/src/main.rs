//! Gateway process entry point.
//!
//! Provides CLI interface, configuration loading, and startup of the
//! client-facing gateway.

use clap::{Arg, Command};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gateway_server::config::{AppConfig, LoggingSettings};
use gateway_server::GatewayService;

/// Command line arguments
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub bind_address: Option<String>,
    pub router_address: Option<String>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    /// Parse command line arguments
    pub fn parse() -> Self {
        let matches = Command::new("Cluster Gateway")
            .version(option_env!("CARGO_PKG_VERSION").unwrap_or("UNK"))
            .about("WebSocket gateway fronting the cluster for game clients")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("gateway.toml"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("Bind address for client connections (e.g., 0.0.0.0:9000)"),
            )
            .arg(
                Arg::new("router")
                    .short('r')
                    .long("router")
                    .value_name("ADDRESS")
                    .help("Router address (e.g., 127.0.0.1:7100)"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .get_matches();

        Self {
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .expect("Default config path should always be set"),
            ),
            bind_address: matches.get_one::<String>("bind").cloned(),
            router_address: matches.get_one::<String>("router").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

/// Initialize logging system
fn setup_logging(config: &LoggingSettings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    }

    info!("🔧 Logging initialized with level: {}", config.level);
    Ok(())
}

/// Setup graceful shutdown signal handling
async fn setup_signal_handlers() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("📡 Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    if let Some(bind_address) = args.bind_address {
        config.server.bind_address = bind_address;
    }
    if let Some(router_address) = args.router_address {
        config.cluster.router_address = router_address;
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    if let Err(e) = config.validate() {
        anyhow::bail!("Configuration validation failed: {e}");
    }

    setup_logging(&config.logging)?;

    info!("🚀 Cluster Gateway starting");
    info!("  🌐 Bind address: {}", config.server.bind_address);
    info!("  📇 Advertised as: {}", config.server.advertise_address);
    info!("  🧭 Router: {}", config.cluster.router_address);
    info!(
        "  🚦 Rate limit: {} msgs / window, action {:?}",
        config.rate_limit.messages_per_window, config.rate_limit.action
    );

    let service = GatewayService::new(config);
    let runner = {
        let service = service.clone();
        tokio::spawn(service.run())
    };

    info!("🛑 Press Ctrl+C to gracefully shutdown");
    setup_signal_handlers().await?;

    info!("🛑 Shutdown signal received, initiating graceful shutdown...");
    service.shutdown();

    match runner.await {
        Ok(Ok(())) => info!("✅ Gateway shutdown complete"),
        Ok(Err(e)) => {
            error!("❌ Gateway error: {e}");
            std::process::exit(1);
        }
        Err(e) => {
            error!("❌ Gateway task panicked: {e}");
            std::process::exit(1);
        }
    }

    Ok(())
}
