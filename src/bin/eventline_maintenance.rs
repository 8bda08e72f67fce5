//! eventline-maintenance: retention worker
//!
//! Connects to the configured event store and trims events older than
//! `maintenance.retention_days` every `maintenance.interval_secs` until
//! interrupted.
//!
//! ## Configuration
//! - EVENTLINE_CONFIG: path to a YAML config file (optional)
//! - EVENTLINE__STORE__TYPE: memory | sqlite | redis | postgres
//! - EVENTLINE__MAINTENANCE__RETENTION_DAYS: retention window in days
//! - EVENTLINE_LOG / EVENTLINE_LOG_FORMAT: log filter and format

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use eventline::bus::EventBus;
use eventline::config::Config;
use eventline::maintenance::run_retention;
use eventline::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;
    info!(store = ?config.store.store_type, "Starting eventline-maintenance");

    let bus = Arc::new(EventBus::from_config(&config).await?);
    bus.initialize().await?;

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(run_retention(
        bus.clone(),
        config.maintenance.clone(),
        cancel.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    cancel.cancel();
    if let Err(e) = worker.await {
        error!(error = %e, "Retention task failed");
    }

    bus.close().await?;
    Ok(())
}
