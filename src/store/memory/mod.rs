//! In-memory event store.
//!
//! Bounded ring buffers per event type plus one global stream. Consumer
//! groups each own a mutex over their cursors and claims, so claim cycles
//! of different groups never contend. Nothing survives the process.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::consumer::{ConsumerHandler, Subscription, SubscriptionSet};
use super::types::{
    ConsumedEvent, ConsumerConfig, DlqEntry, EventFilter, PendingClaim, StoredEvent, StreamId,
    StreamInfo,
};
use super::wakeup::{wait_any, ClaimMarks, Wakeup};
use super::{EventStore, Result, StoreError};
use crate::event::Event;

/// Default per-type ring capacity.
pub const DEFAULT_MAX_EVENTS_PER_TYPE: usize = 10_000;
/// Default global ring capacity.
pub const DEFAULT_MAX_GLOBAL_EVENTS: usize = 100_000;

#[derive(Default)]
struct Streams {
    next_seq: u64,
    by_type: BTreeMap<String, VecDeque<StoredEvent>>,
    global: VecDeque<StoredEvent>,
}

impl Streams {
    fn find_in(buffer: &VecDeque<StoredEvent>, stream_id: StreamId) -> Option<&StoredEvent> {
        buffer
            .binary_search_by_key(&stream_id, |e| e.stream_id)
            .ok()
            .and_then(|i| buffer.get(i))
    }

    fn get(&self, stream_id: StreamId) -> Option<&StoredEvent> {
        Self::find_in(&self.global, stream_id)
            .or_else(|| self.by_type.values().find_map(|b| Self::find_in(b, stream_id)))
    }

    fn get_typed(&self, event_type: &str, stream_id: StreamId) -> Option<&StoredEvent> {
        self.by_type
            .get(event_type)
            .and_then(|b| Self::find_in(b, stream_id))
    }
}

/// Cursors and claims of one consumer group.
#[derive(Default)]
struct GroupState {
    positions: HashMap<String, StreamId>,
    claims: BTreeMap<StreamId, PendingClaim>,
}

struct Inner {
    streams: RwLock<Streams>,
    groups: RwLock<HashMap<String, Arc<Mutex<GroupState>>>>,
    dlq: Mutex<Vec<DlqEntry>>,
    appended: Wakeup,
    claim_marks: ClaimMarks,
    subscriptions: SubscriptionSet,
    max_events_per_type: usize,
    max_global_events: usize,
    fail_on_append: RwLock<bool>,
    unavailable: RwLock<bool>,
}

/// Reference backend. Cloning shares the same store.
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS_PER_TYPE, DEFAULT_MAX_GLOBAL_EVENTS)
    }

    pub fn with_capacity(max_events_per_type: usize, max_global_events: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                streams: RwLock::new(Streams::default()),
                groups: RwLock::new(HashMap::new()),
                dlq: Mutex::new(Vec::new()),
                appended: Wakeup::new(),
                claim_marks: ClaimMarks::new(),
                subscriptions: SubscriptionSet::new(),
                max_events_per_type: max_events_per_type.max(1),
                max_global_events: max_global_events.max(1),
                fail_on_append: RwLock::new(false),
                unavailable: RwLock::new(false),
            }),
        }
    }

    /// Make `append` fail with a connection error.
    pub async fn set_fail_on_append(&self, fail: bool) {
        *self.inner.fail_on_append.write().await = fail;
    }

    /// Make every operation fail with a connection error.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.inner.unavailable.write().await = unavailable;
    }

    /// Dead-letter entries, replayed ones included.
    pub async fn dlq_entries(&self) -> Vec<DlqEntry> {
        self.inner.dlq.lock().await.clone()
    }

    async fn check_available(&self) -> Result<()> {
        if *self.inner.unavailable.read().await {
            return Err(StoreError::Connection("in-memory store marked unavailable".into()));
        }
        Ok(())
    }

    async fn group(&self, name: &str) -> Arc<Mutex<GroupState>> {
        if let Some(group) = self.inner.groups.read().await.get(name) {
            return group.clone();
        }
        self.inner
            .groups
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    async fn existing_group(&self, name: &str) -> Option<Arc<Mutex<GroupState>>> {
        self.inner.groups.read().await.get(name).cloned()
    }

    fn claim_not_found(event: &ConsumedEvent) -> StoreError {
        StoreError::ClaimNotFound {
            stream_id: event.stream_id(),
            consumer_group: event.consumer_group.clone(),
        }
    }

    async fn push(&self, event: Event) -> StreamId {
        let mut streams = self.inner.streams.write().await;
        streams.next_seq += 1;
        let stored = StoredEvent {
            stream_id: StreamId::from_seq(streams.next_seq),
            event,
        };
        let stream_id = stored.stream_id;

        let per_type = self.inner.max_events_per_type;
        let buffer = streams.by_type.entry(stored.event.event_type.clone()).or_default();
        buffer.push_back(stored.clone());
        while buffer.len() > per_type {
            buffer.pop_front();
        }

        streams.global.push_back(stored);
        while streams.global.len() > self.inner.max_global_events {
            streams.global.pop_front();
        }
        drop(streams);

        self.inner.appended.wake();
        stream_id
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.subscriptions.shutdown().await;
        Ok(())
    }

    async fn append(&self, event: &Event) -> Result<StreamId> {
        self.check_available().await?;
        if *self.inner.fail_on_append.read().await {
            return Err(StoreError::Connection("simulated append failure".into()));
        }
        let stream_id = self.push(event.clone()).await;
        debug!(event_type = %event.event_type, stream_id = %stream_id, "Appended event");
        Ok(stream_id)
    }

    async fn get_event(&self, stream_id: StreamId) -> Result<Option<StoredEvent>> {
        self.check_available().await?;
        Ok(self.inner.streams.read().await.get(stream_id).cloned())
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        self.check_available().await?;
        let streams = self.inner.streams.read().await;
        let limit = filter.limit.unwrap_or(usize::MAX);

        if filter.event_types.is_empty() {
            return Ok(streams
                .global
                .iter()
                .filter(|e| filter.matches(e))
                .take(limit)
                .cloned()
                .collect());
        }

        let mut found: Vec<StoredEvent> = filter
            .event_types
            .iter()
            .filter_map(|t| streams.by_type.get(t))
            .flat_map(|buffer| buffer.iter().filter(|e| filter.matches(e)).cloned())
            .collect();
        found.sort_by_key(|e| e.stream_id);
        found.truncate(limit);
        Ok(found)
    }

    async fn subscribe(
        &self,
        config: ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription> {
        self.check_available().await?;
        Ok(self.inner.subscriptions.spawn(self.clone(), config, handler))
    }

    async fn claim(&self, config: &ConsumerConfig) -> Result<Vec<ConsumedEvent>> {
        self.check_available().await?;
        self.inner.claim_marks.record(config, self.inner.appended.generation());
        let group = self.group(&config.consumer_group).await;
        let mut state = group.lock().await;
        let streams = self.inner.streams.read().await;

        let types: Vec<String> = if config.event_types.is_empty() {
            streams.by_type.keys().cloned().collect()
        } else {
            config.event_types.clone()
        };

        let now = Utc::now();
        let lease = config.claim_timeout();
        let mut budget = config.batch_size.max(1);
        let mut claimed = Vec::new();

        for event_type in &types {
            if budget == 0 {
                break;
            }
            let Some(buffer) = streams.by_type.get(event_type) else {
                continue;
            };
            let cursor = state.positions.get(event_type).copied().unwrap_or_default();
            let start = buffer.partition_point(|e| e.stream_id <= cursor);

            for stored in buffer.iter().skip(start) {
                if budget == 0 {
                    break;
                }
                if state.claims.contains_key(&stored.stream_id) {
                    continue;
                }
                let claim = PendingClaim::new(
                    stored,
                    &config.consumer_group,
                    &config.consumer_name,
                    now,
                    lease,
                );
                claimed.push(claim.to_consumed(stored.clone()));
                state.claims.insert(stored.stream_id, claim);
                state.positions.insert(event_type.clone(), stored.stream_id);
                budget -= 1;
            }
        }

        if budget > 0 {
            let retry_delay = chrono::Duration::milliseconds(config.retry_delay_ms as i64);
            let due: Vec<StreamId> = state
                .claims
                .values()
                .filter(|c| types.contains(&c.event_type) && c.is_claimable(now, retry_delay))
                .map(|c| c.stream_id)
                .take(budget)
                .collect();

            for stream_id in due {
                let Some(claim) = state.claims.get_mut(&stream_id) else {
                    continue;
                };
                match streams.get_typed(&claim.event_type, stream_id) {
                    Some(stored) => {
                        claim.reclaim(&config.consumer_name, now, lease);
                        claimed.push(claim.to_consumed(stored.clone()));
                    }
                    None => {
                        warn!(stream_id = %stream_id, "Dropping claim on evicted event");
                        state.claims.remove(&stream_id);
                    }
                }
            }
        }

        Ok(claimed)
    }

    async fn wait_for_events(&self, config: &ConsumerConfig, timeout: Duration) {
        wait_any(&[&self.inner.appended], self.inner.claim_marks.last(config), timeout).await;
    }

    async fn ack(&self, event: &ConsumedEvent) -> Result<()> {
        self.check_available().await?;
        let group = self
            .existing_group(&event.consumer_group)
            .await
            .ok_or_else(|| Self::claim_not_found(event))?;
        let mut state = group.lock().await;

        if state.claims.remove(&event.stream_id()).is_some() {
            return Ok(());
        }
        let cursor = state.positions.get(event.event_type()).copied().unwrap_or_default();
        if event.stream_id() <= cursor {
            Ok(())
        } else {
            Err(Self::claim_not_found(event))
        }
    }

    async fn nack(&self, event: &ConsumedEvent, reason: &str) -> Result<()> {
        self.check_available().await?;
        let group = self
            .existing_group(&event.consumer_group)
            .await
            .ok_or_else(|| Self::claim_not_found(event))?;
        let mut state = group.lock().await;
        let claim = state
            .claims
            .get_mut(&event.stream_id())
            .ok_or_else(|| Self::claim_not_found(event))?;
        claim.record_nack(reason, Utc::now());
        Ok(())
    }

    async fn extend_timeout(&self, event: &ConsumedEvent, seconds: u64) -> Result<()> {
        self.check_available().await?;
        let group = self
            .existing_group(&event.consumer_group)
            .await
            .ok_or_else(|| Self::claim_not_found(event))?;
        let mut state = group.lock().await;
        let claim = state
            .claims
            .get_mut(&event.stream_id())
            .ok_or_else(|| Self::claim_not_found(event))?;
        claim.extend(seconds, Utc::now());
        Ok(())
    }

    async fn get_pending_events(
        &self,
        consumer_group: &str,
        max_idle_ms: u64,
    ) -> Result<Vec<ConsumedEvent>> {
        self.check_available().await?;
        let Some(group) = self.existing_group(consumer_group).await else {
            return Ok(Vec::new());
        };
        let state = group.lock().await;
        let streams = self.inner.streams.read().await;
        let cutoff = Utc::now() - chrono::Duration::milliseconds(max_idle_ms as i64);

        Ok(state
            .claims
            .values()
            .filter(|c| c.claimed_at <= cutoff)
            .filter_map(|c| {
                streams
                    .get_typed(&c.event_type, c.stream_id)
                    .map(|stored| c.to_consumed(stored.clone()))
            })
            .collect())
    }

    async fn move_to_dlq(&self, event: &ConsumedEvent, reason: &str) -> Result<()> {
        self.check_available().await?;
        let entry = DlqEntry::from_consumed(Uuid::new_v4().to_string(), event, reason);
        self.inner.dlq.lock().await.push(entry);
        Ok(())
    }

    async fn replay_dlq(&self, consumer_group: &str, event_types: Option<&[String]>) -> Result<u64> {
        self.check_available().await?;
        let mut dlq = self.inner.dlq.lock().await;
        let mut replayed = 0;

        for entry in dlq.iter_mut() {
            if entry.replayed || entry.consumer_group != consumer_group {
                continue;
            }
            if event_types.is_some_and(|types| !types.contains(&entry.event_type)) {
                continue;
            }
            let event = Event::from_payload(entry.event_payload.clone())?;
            let stream_id = self.push(event).await;
            debug!(
                original_stream_id = %entry.original_stream_id,
                stream_id = %stream_id,
                "Replayed dead letter"
            );
            entry.replayed = true;
            replayed += 1;
        }
        Ok(replayed)
    }

    async fn get_stream_info(&self) -> Result<StreamInfo> {
        self.check_available().await?;
        let mut info = StreamInfo {
            backend: self.backend_name().to_string(),
            ..StreamInfo::default()
        };
        {
            let streams = self.inner.streams.read().await;
            for (event_type, buffer) in &streams.by_type {
                info.events_per_type.insert(event_type.clone(), buffer.len() as u64);
            }
            info.total_events = info.events_per_type.values().sum();
        }

        let groups: Vec<(String, Arc<Mutex<GroupState>>)> = self
            .inner
            .groups
            .read()
            .await
            .iter()
            .map(|(name, group)| (name.clone(), group.clone()))
            .collect();
        for (name, group) in groups {
            info.pending_count += group.lock().await.claims.len() as u64;
            info.consumer_groups.push(name);
        }
        info.consumer_groups.sort();

        info.dlq_count = self.inner.dlq.lock().await.iter().filter(|e| !e.replayed).count() as u64;
        Ok(info)
    }

    async fn trim_old_events(&self, max_age_days: u32, event_types: Option<&[String]>) -> Result<u64> {
        self.check_available().await?;
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let in_scope = |t: &str| event_types.map_or(true, |types| types.iter().any(|s| s == t));
        let keep = |e: &StoredEvent| !(e.event.timestamp < cutoff && in_scope(e.event_type()));

        let mut streams = self.inner.streams.write().await;
        let mut removed = 0;
        for buffer in streams.by_type.values_mut() {
            let before = buffer.len();
            buffer.retain(|e| keep(e));
            removed += (before - buffer.len()) as u64;
        }
        streams.global.retain(|e| keep(e));
        Ok(removed)
    }
}
