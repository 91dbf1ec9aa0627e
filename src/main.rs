//! # parley
//!
//! Messaging server binary: loads settings, opens the store and serves
//! until Ctrl-C.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::{MemoryStore, Store};
use parley_server::{ServerConfig, ServerContext};
use parley_settings::ParleySettings;
use parley_store::SqliteStore;
use parley_telemetry::TelemetryConfig;
use tracing::{info, warn};

/// Parley messaging server.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Real-time messaging server")]
struct Cli {
    /// Settings file (defaults to `~/.parley/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind, e.g. `127.0.0.1:6060`. Overrides settings.
    #[arg(long)]
    listen: Option<String>,

    /// `SQLite` database path. Without one, data lives in memory.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Log level (`trace`..`error`). `RUST_LOG` still wins.
    #[arg(long)]
    log_level: Option<String>,
}

fn load(cli: &Cli) -> Result<ParleySettings> {
    let path = cli.config.clone().unwrap_or_else(parley_settings::settings_path);
    let mut settings = parley_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(store) = &cli.store {
        settings.store.path = Some(store.display().to_string());
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    Ok(settings)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn open_store(settings: &ParleySettings) -> Result<Arc<dyn Store>> {
    match settings.store.path.as_deref() {
        Some(path) => {
            let path = Path::new(path);
            ensure_parent_dir(path)?;
            let store = SqliteStore::open(path)
                .with_context(|| format!("Failed to open store at {}", path.display()))?;
            info!(path = %path.display(), "sqlite store opened");
            Ok(Arc::new(store))
        }
        None => {
            info!("no store path configured, using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    let _ = parley_telemetry::init_telemetry(&TelemetryConfig::from_level_str(
        &settings.logging.level,
        settings.logging.json,
    ));
    let metrics = match parley_telemetry::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics disabled");
            None
        }
    };

    let store = open_store(&settings)?;
    let mut config = ServerConfig::from(&settings);
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let ctx = ServerContext::new(config, store);
    let server = parley_server::start(ctx, metrics)
        .await
        .context("Failed to start server")?;
    info!(addr = %server.local_addr(), "parley ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
