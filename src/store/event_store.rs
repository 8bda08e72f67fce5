//! EventStore trait definition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::consumer::{ConsumerHandler, Subscription};
use super::types::{ConsumedEvent, ConsumerConfig, EventFilter, StoredEvent, StreamId, StreamInfo};
use super::Result;
use crate::event::Event;

/// Contract every backend implements.
///
/// Implementations:
/// - `InMemoryEventStore`: bounded ring buffers, reference implementation
/// - `SqliteEventStore`: embedded file with exclusive claim transactions
/// - `RedisStreamStore`: Redis Streams with native consumer groups
/// - `PostgresEventStore`: table + LISTEN/NOTIFY wakeups
///
/// Durable consumption is split in two layers. `claim`, `ack`, `nack`,
/// `extend_timeout` and `move_to_dlq` are the per-backend primitives;
/// [`super::consumer::run`] is the shared poll loop that `subscribe` spawns
/// on top of them.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Short backend identifier for logs and [`StreamInfo::backend`].
    fn backend_name(&self) -> &'static str;

    /// Open connections and create schema. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Cancel every subscription started through this store, wait for the
    /// poll loops to finish, then release resources. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Durable single-event write.
    async fn append(&self, event: &Event) -> Result<StreamId>;

    async fn get_event(&self, stream_id: StreamId) -> Result<Option<StoredEvent>>;

    /// Events matching `filter`, ascending by stream id.
    async fn query(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>>;

    /// Start an independent poll loop delivering claimed events to `handler`.
    async fn subscribe(
        &self,
        config: ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription>;

    /// Run one atomic claim cycle over `config.event_types`.
    ///
    /// Returns new events after the group cursor plus expired claims, at
    /// most `config.batch_size` in total.
    async fn claim(&self, config: &ConsumerConfig) -> Result<Vec<ConsumedEvent>>;

    /// Block until new events may be claimable or `timeout` elapses.
    async fn wait_for_events(&self, config: &ConsumerConfig, timeout: Duration);

    /// Whether `claim` already blocks server-side while idle. The poll loop
    /// skips its own idle wait when it does.
    fn claim_blocks(&self) -> bool {
        false
    }

    /// Remove the claim. A second ack is a no-op; acking an event the group
    /// never claimed is [`super::StoreError::ClaimNotFound`].
    async fn ack(&self, event: &ConsumedEvent) -> Result<()>;

    /// Record a failed attempt and keep the claim.
    async fn nack(&self, event: &ConsumedEvent, reason: &str) -> Result<()>;

    /// Push the claim's timeout forward by `seconds`.
    async fn extend_timeout(&self, event: &ConsumedEvent, seconds: u64) -> Result<()>;

    /// Claimed events of `consumer_group` whose claim is older than `max_idle_ms`.
    async fn get_pending_events(
        &self,
        consumer_group: &str,
        max_idle_ms: u64,
    ) -> Result<Vec<ConsumedEvent>>;

    /// Copy the event into the dead-letter queue. The claim stays until acked.
    async fn move_to_dlq(&self, event: &ConsumedEvent, reason: &str) -> Result<()>;

    /// Re-append unreplayed dead letters of `consumer_group`. Returns the count.
    async fn replay_dlq(&self, consumer_group: &str, event_types: Option<&[String]>) -> Result<u64>;

    async fn get_stream_info(&self) -> Result<StreamInfo>;

    /// Delete events older than `max_age_days`. Returns the count removed.
    async fn trim_old_events(&self, max_age_days: u32, event_types: Option<&[String]>) -> Result<u64>;
}
