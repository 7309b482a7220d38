//! dispensad - timed dispensing-practice sessions over a local socket

use anyhow::{Context, Result};
use clap::Parser;
use dispensa_config::load_config;
use dispensa_store::{SqliteStore, Store};
use dispensa_util::{default_config_path, SystemClock};
use dispensad::Service;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// dispensad - session service for timed dispensing practice
#[derive(Parser, Debug)]
#[command(name = "dispensad")]
#[command(about = "Session service for timed dispensing practice", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/dispensa/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set DISPENSA_SOCKET env var)
    #[arg(short, long, env = "DISPENSA_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set DISPENSA_DATA_DIR env var)
    #[arg(short, long, env = "DISPENSA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "dispensad starting");

    let catalog = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    info!(
        config_path = %args.config.display(),
        case_count = catalog.cases.len(),
        "Configuration loaded"
    );

    let socket_path = args
        .socket
        .clone()
        .unwrap_or_else(|| catalog.service.socket_path.clone());

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| catalog.service.data_dir.clone());

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

    let db_path = data_dir.join("dispensad.db");
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open database {:?}", db_path))?,
    );

    info!(db_path = %db_path.display(), "Store initialized");

    let service = Service::new(catalog, &socket_path, store, Arc::new(SystemClock)).await?;

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            _ = sighup.recv() => info!("Received SIGHUP, shutting down gracefully"),
        }
    };

    service.run(shutdown).await
}
