//! # Scale Daemon
//!
//! Long-running host for the scale sync service.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. ServiceConfig::load (defaults < scales.toml < SCALES_* env)         │
//! │  2. tracing subscriber (RUST_LOG, else config log_level)                │
//! │  3. SQLite, when [database] path is set                                 │
//! │  4. ScaleService::restore (caches, then schedules)                      │
//! │  5. apply the schedules declared in [[devices]]                         │
//! │  6. wait for Ctrl+C / SIGTERM, stop timers, close the pool              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `scale-daemon [path/to/scales.toml]`

mod credentials;
mod file_link;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use scale_db::{Database, DbConfig};
use scale_sync::{ScaleService, ServiceConfig};

use crate::credentials::EnvCredentials;
use crate::file_link::FileLinkFactory;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ServiceConfig::load(config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        devices = config.devices.len(),
        auto_update = config.auto_update.enabled,
        "Starting scale daemon"
    );

    let database = match &config.database.path {
        Some(path) => {
            let db = Database::new(DbConfig::new(path)).await?;
            info!(path = %path.display(), "Database ready");
            Some(db)
        }
        None => {
            warn!("No database path configured, caches will not survive a restart");
            None
        }
    };

    let devices = config.devices.clone();
    let defaults = config.auto_update.clone();
    let service = ScaleService::new(
        config,
        Arc::new(FileLinkFactory),
        Arc::new(EnvCredentials),
        database,
    );

    // Devices must be known before restore can re-arm their schedules.
    for entry in &devices {
        service.engine().directory().upsert(entry.descriptor());
    }
    service.restore().await?;

    // A schedule declared in the file wins over the restored one.
    for entry in &devices {
        let descriptor = entry.descriptor();
        let device_id = descriptor.id;
        let schedule = match entry.auto_update {
            Some(_) => entry.auto_update_config(&defaults),
            None => service
                .registry()
                .config(device_id)
                .unwrap_or_else(|| entry.auto_update_config(&defaults)),
        };
        if let Err(e) = service.device_updated(descriptor, schedule).await {
            error!(device_id = %device_id, error = %e, "Failed to register device");
        }
    }

    info!(
        timers = service.registry().active_timer_count(),
        "Scale daemon running"
    );

    shutdown_signal().await;
    service.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping timers...");
}
