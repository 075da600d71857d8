use anyhow::{Context, Result};
use clap::Parser;
use gamegate_core::config::{GatewayConfig, LogFormat, LoggingConfig};
use gamegate_pool::{Gateway, MemorySessionStore, MetricsExporter};
use gamegate_router::StaticDiscovery;
use gamegate_rpc::TcpConnector;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod listener;

use listener::GatewayListener;

/// GameGate - game server gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "GAMEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the client listener address
    #[arg(short, long)]
    bind: Option<String>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    validate_only: bool,
}

fn load_config(args: &Args) -> Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_config_builder(path)
            .with_context(|| format!("Failed to load config file: {path:?}"))?,
        None => GatewayConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.listener.bind_addr = bind.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.parse_level().to_string().to_lowercase()));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    if args.validate_only {
        println!("configuration is valid");
        return Ok(());
    }

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting GameGate");
    if let Some(path) = &args.config {
        info!("Configuration loaded from {:?}", path);
    }

    let mut exporter = MetricsExporter::new(config.metrics.clone());
    exporter.init()?;

    let discovery = Arc::new(StaticDiscovery::with_instances(
        config.discovery.instances.iter().cloned(),
    ));
    let connector = TcpConnector::new(config.rpc_pool.connect_timeout());
    let bind_addr = config.listener.bind_addr.clone();

    let gateway = Arc::new(Gateway::new(
        config,
        discovery,
        Arc::new(MemorySessionStore::new()),
        connector,
    )?);
    gateway.start().await?;

    let listener = GatewayListener::bind(&bind_addr, Arc::clone(&gateway)).await?;
    info!(bind_addr = %listener.local_addr()?, "Accepting game clients");

    let cancel = CancellationToken::new();
    let mut accept_loop = tokio::spawn(listener.run(cancel.clone()));

    tokio::select! {
        result = &mut accept_loop => {
            if let Err(e) = result {
                error!("Accept loop failed: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping gateway...");
            cancel.cancel();
            let _ = accept_loop.await;
        }
    }

    gateway.shutdown().await;
    Ok(())
}
