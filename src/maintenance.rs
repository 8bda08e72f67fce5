//! Periodic retention trimming.
//!
//! Deletes events older than `retention_days` on a fixed interval and logs
//! the store's stream info after each pass. Pending claims and dead letters
//! are left alone.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::{EventBus, Result};
use crate::config::MaintenanceConfig;

/// Run one trim pass. Returns the number of events removed.
pub async fn trim_once(bus: &EventBus, config: &MaintenanceConfig) -> Result<u64> {
    let removed = bus
        .trim_old_events(config.retention_days, config.event_types())
        .await?;
    if removed > 0 {
        info!(removed, retention_days = config.retention_days, "Retention: trimmed old events");
    } else {
        debug!("Retention: nothing to trim");
    }

    let stats = bus.get_stats().await?;
    if let Some(stream) = stats.stream {
        info!(
            backend = %stream.backend,
            total_events = stream.total_events,
            pending = stream.pending_count,
            dlq = stream.dlq_count,
            consumer_groups = stream.consumer_groups.len(),
            "Stream info"
        );
    }
    Ok(removed)
}

/// Trim on every tick of `config.interval()` until `cancel` fires.
///
/// A failed pass is logged and retried on the next tick.
pub async fn run_retention(bus: Arc<EventBus>, config: MaintenanceConfig, cancel: CancellationToken) {
    info!(
        retention_days = config.retention_days,
        interval_secs = config.interval().as_secs(),
        "Retention job started"
    );

    let mut interval = tokio::time::interval(config.interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Retention job stopping");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = trim_once(&bus, &config).await {
                    error!(error = %e, "Retention: trim failed");
                }
            }
        }
    }
}
