//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::store::consumer::MAX_BACKOFF;
use crate::store::ConsumerConfig;

/// Backoff for a consumer loop that lost its backend.
///
/// - Min delay: `retry_delay_ms`
/// - Max delay: 30s
/// - Max attempts: `max_retries`
/// - Jitter enabled
pub fn consumer_backoff(config: &ConsumerConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.retry_delay().min(MAX_BACKOFF))
        .with_max_delay(MAX_BACKOFF)
        .with_max_times(config.max_retries as usize)
        .with_jitter()
}

/// Backoff for connecting a store at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
