//! Bus and consumer configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::store::ConsumerConfig;

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Append published events to the store. When false the bus is
    /// in-process only.
    pub persist: bool,
    /// Upper bound on a publish-time append. Default: 5000.
    pub persist_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            persist: true,
            persist_timeout_ms: 5000,
        }
    }
}

impl BusConfig {
    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

/// Defaults applied to durable subscriptions that do not set them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerDefaults {
    pub batch_size: usize,
    pub block_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub dead_letter_after: u32,
    pub claim_timeout_ms: u64,
}

impl Default for ConsumerDefaults {
    fn default() -> Self {
        let base = ConsumerConfig::default();
        Self {
            batch_size: base.batch_size,
            block_timeout_ms: base.block_timeout_ms,
            max_retries: base.max_retries,
            retry_delay_ms: base.retry_delay_ms,
            dead_letter_after: base.dead_letter_after,
            claim_timeout_ms: base.claim_timeout_ms,
        }
    }
}

impl ConsumerDefaults {
    /// Consumer config for one subscription with these defaults.
    pub fn consumer_config(
        &self,
        consumer_group: impl Into<String>,
        consumer_name: impl Into<String>,
        event_types: Vec<String>,
    ) -> ConsumerConfig {
        ConsumerConfig::new(consumer_group, consumer_name, event_types)
            .with_batch_size(self.batch_size)
            .with_block_timeout_ms(self.block_timeout_ms)
            .with_max_retries(self.max_retries)
            .with_retry_delay_ms(self.retry_delay_ms)
            .with_dead_letter_after(self.dead_letter_after)
            .with_claim_timeout_ms(self.claim_timeout_ms)
    }
}
