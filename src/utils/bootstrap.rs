//! Bootstrap utilities for eventline processes.

use backon::Retryable;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;
use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};
use crate::store::{EventStore, StoreError};

/// Initialize tracing with the EVENTLINE_LOG environment variable.
///
/// Defaults to "info" level if EVENTLINE_LOG is not set. Set
/// EVENTLINE_LOG_FORMAT=json for JSON lines.
pub fn init_tracing() {
    let json = std::env::var(LOG_FORMAT_ENV_VAR).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Connect `store` with exponential backoff on connection errors.
///
/// Other errors (bad schema, bad config) fail immediately.
pub async fn connect_with_retry(store: &dyn EventStore) -> Result<(), StoreError> {
    let backend = store.backend_name();
    (|| async { store.connect().await })
        .retry(connection_backoff())
        .when(StoreError::is_connection)
        .notify(|e, delay| {
            warn!(
                backend,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Store connect failed, retrying"
            );
        })
        .await?;
    tracing::info!(backend, "Connected to event store");
    Ok(())
}
