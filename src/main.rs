//! Sigfleet - Signaling Connection Fleet Server
//!
//! Runs the connection-management fleet: workers owning stream connections,
//! the Manager brokering them, and listeners feeding inbound connections in.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sigfleet::{config::ConfigManager, resolve::DnsResolver, Fleet, ShutdownCoordinator};

/// CLI arguments for sigfleet
#[derive(Parser, Debug)]
#[command(name = "sigfleet")]
#[command(about = "Signaling connection fleet server")]
#[command(version)]
#[command(long_about = "
Sigfleet - Signaling Connection Fleet Server

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  SIGFLEET_LISTEN_ADDRS      - Comma-separated listen addresses
  SIGFLEET_WORKERS           - Number of worker units
  SIGFLEET_CONNECT_TIMEOUT   - Outbound connect budget (e.g., 5s, 1m)
  SIGFLEET_IDLE_TIMEOUT      - Idle eviction window (e.g., 2m)
  SIGFLEET_REDIRECT_OUTBOUND - Workers originate their own connects (true/false)
  SIGFLEET_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(short, long, help = "Listen address (e.g., 0.0.0.0:5060)")]
    pub listen: Option<String>,

    /// Number of worker units (overrides config file)
    #[arg(short, long, help = "Number of worker units")]
    pub workers: Option<usize>,

    /// Outbound connect timeout in seconds
    #[arg(long, help = "Outbound connect timeout in seconds")]
    pub connect_timeout: Option<u64>,

    /// Let workers originate outbound connects themselves
    #[arg(long, help = "Workers originate outbound connects themselves")]
    pub redirect_outbound: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("Starting sigfleet v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.listen.as_deref(),
        args.workers,
        args.connect_timeout,
        args.redirect_outbound,
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Listen addresses: {:?}", config.listen.addrs);
        info!("  Workers: {}", config.fleet.workers);
        info!("  Connect timeout: {:?}", config.timeouts.connect);
        info!("  Idle timeout: {:?}", config.timeouts.idle);
        info!(
            "  Outbound redirect: {}",
            if config.fleet.redirect_outbound {
                "enabled"
            } else {
                "disabled"
            }
        );
        return Ok(());
    }

    let shutdown_coordinator = ShutdownCoordinator::new(config.timeouts.shutdown);
    let resolver = Arc::new(DnsResolver::new(config.timeouts.resolve));

    let mut fleet = Fleet::new(config, resolver);
    fleet.start()?;
    let bound = fleet.start_listeners().await?;
    info!("Accepting signaling connections on {:?}", bound);

    // Stand-in for the protocol layer: drain inbound payloads and log them.
    // A real deployment parses and routes these.
    if let Some(mut inbound) = fleet.take_inbound() {
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                debug!(conn = %msg.conn, len = msg.bytes.len(), "inbound payload");
            }
        });
    }

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    info!("Initiating graceful shutdown...");
    shutdown_coordinator.drain_fleet(fleet).await;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
