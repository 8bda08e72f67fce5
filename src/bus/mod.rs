//! Event bus.
//!
//! This module contains:
//! - `EventBus`: explicit bus instance with `initialize` / `close` lifecycle
//! - `EventHandler` trait: local, synchronous subscribers
//! - `Middleware` trait: publish-time transform / drop hooks
//!
//! Publishing runs the middleware chain, stamps the schema version, appends
//! to the store (best effort, bounded by `persist_timeout_ms`) and then
//! fans out to local subscribers in subscription order. Durable consumer
//! group subscriptions go through the store's poll loop with migration to
//! the current schema version applied first.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{BusConfig, Config, ConsumerDefaults};
use crate::event::Event;
use crate::store::types::glob_matches;
use crate::store::{
    init_store, ConsumedEvent, ConsumerConfig, ConsumerHandler, EventFilter, EventStore,
    HandlerResult, StoreError, StoredEvent, StreamId, StreamInfo, Subscription,
};
use crate::utils::bootstrap::connect_with_retry;
use crate::versioning::{MigrationError, VersionRegistry};

pub mod middleware;

pub use middleware::{Middleware, TracingMiddleware};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Event bus not initialized")]
    NotInitialized,

    #[error("Event bus closed")]
    Closed,

    #[error("No event store configured")]
    NoStore,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Persistent subscription not found: {0}")]
    SubscriptionNotFound(Uuid),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Handler for events delivered in-process at publish time.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(event))
    }
}

/// Id of a local subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// Result of publishing one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Assigned by the store; `None` when persistence is off or failed.
    pub stream_id: Option<StreamId>,
    /// Local subscribers that handled the event without error.
    pub delivered: usize,
    /// A middleware dropped the event.
    pub dropped: bool,
}

/// Counters plus the store's view.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub dropped: u64,
    pub handler_errors: u64,
    pub local_subscribers: usize,
    pub persistent_subscriptions: usize,
    pub stream: Option<StreamInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusState {
    Created,
    Running,
    Closed,
}

struct LocalSubscriber {
    id: SubscriptionId,
    patterns: Vec<String>,
    handler: Arc<dyn EventHandler>,
}

impl LocalSubscriber {
    /// Empty pattern list matches every type; patterns are globs (`*`, `asset.*`).
    fn matches(&self, event_type: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| glob_matches(p, event_type))
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    dropped: AtomicU64,
    handler_errors: AtomicU64,
}

/// Migrates each delivery to the current schema version before the
/// caller's handler sees it. A migration failure counts as a handler
/// failure, so the event follows the retry / dead-letter path.
struct MigratingHandler {
    registry: Arc<VersionRegistry>,
    inner: Arc<dyn ConsumerHandler>,
}

impl ConsumerHandler for MigratingHandler {
    fn handle(&self, mut event: ConsumedEvent) -> BoxFuture<'static, HandlerResult> {
        match self.registry.migrate_stored(&event.stored) {
            Ok(stored) => {
                event.stored = stored;
                self.inner.handle(event)
            }
            Err(e) => Box::pin(async move { Err(e.into()) }),
        }
    }
}

/// Explicit event bus instance. Share it behind an `Arc`.
pub struct EventBus {
    config: BusConfig,
    consumer_defaults: ConsumerDefaults,
    store: Option<Arc<dyn EventStore>>,
    registry: Arc<VersionRegistry>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    state: RwLock<BusState>,
    subscribers: RwLock<Vec<LocalSubscriber>>,
    next_subscriber: AtomicU64,
    persistent: Mutex<HashMap<Uuid, Subscription>>,
    counters: Counters,
}

impl EventBus {
    /// Create a bus. Without a store the bus is in-process only.
    pub fn new(config: BusConfig, store: Option<Arc<dyn EventStore>>, registry: Arc<VersionRegistry>) -> Self {
        Self {
            config,
            consumer_defaults: ConsumerDefaults::default(),
            store,
            registry,
            middleware: RwLock::new(Vec::new()),
            state: RwLock::new(BusState::Created),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            persistent: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Build the configured store and a registry with the built-in versions.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = init_store(&config.store).await?;
        let registry = VersionRegistry::with_builtin()?;
        Ok(Self::new(config.bus.clone(), Some(store), Arc::new(registry))
            .with_consumer_defaults(config.consumer.clone()))
    }

    pub fn with_consumer_defaults(mut self, defaults: ConsumerDefaults) -> Self {
        self.consumer_defaults = defaults;
        self
    }

    pub fn store(&self) -> Option<&Arc<dyn EventStore>> {
        self.store.as_ref()
    }

    pub fn registry(&self) -> &Arc<VersionRegistry> {
        &self.registry
    }

    /// Connect the store. Idempotent while running.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match *state {
            BusState::Running => return Ok(()),
            BusState::Closed => return Err(BusError::Closed),
            BusState::Created => {}
        }
        if let Some(store) = &self.store {
            connect_with_retry(store.as_ref()).await?;
            info!(backend = store.backend_name(), persist = self.config.persist, "Event bus initialized");
        } else {
            info!("Event bus initialized without a store");
        }
        *state = BusState::Running;
        Ok(())
    }

    /// Stop persistent subscriptions, disconnect the store and refuse
    /// further use. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == BusState::Closed {
                return Ok(());
            }
            *state = BusState::Closed;
        }

        let subscriptions: Vec<Subscription> = self.persistent.lock().await.drain().map(|(_, s)| s).collect();
        for subscription in subscriptions {
            let group = subscription.consumer_group().to_string();
            if let Err(e) = subscription.shutdown().await {
                warn!(consumer_group = %group, error = %e, "Persistent subscription ended with error");
            }
        }
        self.subscribers.write().await.clear();

        if let Some(store) = &self.store {
            store.disconnect().await?;
        }
        info!("Event bus closed");
        Ok(())
    }

    async fn ensure_running(&self) -> Result<()> {
        match *self.state.read().await {
            BusState::Running => Ok(()),
            BusState::Created => Err(BusError::NotInitialized),
            BusState::Closed => Err(BusError::Closed),
        }
    }

    fn require_store(&self) -> Result<&Arc<dyn EventStore>> {
        self.store.as_ref().ok_or(BusError::NoStore)
    }

    pub async fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.write().await.push(middleware);
    }

    /// Publish one event.
    ///
    /// A store outage never fails the publish; the event is still delivered
    /// to local subscribers and `stream_id` is `None`.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(event_type = %event.event_type))]
    pub async fn publish(&self, event: Event) -> Result<PublishOutcome> {
        self.ensure_running().await?;

        let Some(mut event) = self.run_middleware(event).await else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(PublishOutcome {
                dropped: true,
                ..PublishOutcome::default()
            });
        };

        if event.version.is_none() {
            event.version = Some(self.registry.current_version(&event.event_type));
        }

        let stream_id = if self.config.persist {
            self.persist(&event).await
        } else {
            None
        };

        let delivered = self.fan_out(Arc::new(event)).await;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(PublishOutcome {
            stream_id,
            delivered,
            dropped: false,
        })
    }

    async fn run_middleware(&self, event: Event) -> Option<Event> {
        let chain: Vec<Arc<dyn Middleware>> = self.middleware.read().await.clone();
        let mut event = event;
        for middleware in chain {
            match middleware.before_publish(event).await {
                Some(next) => event = next,
                None => {
                    debug!(middleware = middleware.name(), "Event dropped by middleware");
                    return None;
                }
            }
        }
        Some(event)
    }

    async fn persist(&self, event: &Event) -> Option<StreamId> {
        let store = self.store.as_ref()?;
        match tokio::time::timeout(self.config.persist_timeout(), store.append(event)).await {
            Ok(Ok(stream_id)) => {
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                Some(stream_id)
            }
            Ok(Err(e)) => {
                self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    backend = store.backend_name(),
                    error = %e,
                    "Persist failed, delivering in-process only"
                );
                None
            }
            Err(_) => {
                self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    backend = store.backend_name(),
                    timeout_ms = self.config.persist_timeout_ms,
                    "Persist timed out, delivering in-process only"
                );
                None
            }
        }
    }

    /// Deliver to matching local subscribers in subscription order.
    async fn fan_out(&self, event: Arc<Event>) -> usize {
        let targets: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = self
            .subscribers
            .read()
            .await
            .iter()
            .filter(|s| s.matches(&event.event_type))
            .map(|s| (s.id, s.handler.clone()))
            .collect();

        let mut delivered = 0;
        for (id, handler) in targets {
            let attempt = AssertUnwindSafe(handler.handle(event.clone())).catch_unwind().await;
            match attempt {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    error!(subscriber = %id, event_type = %event.event_type, error = %e, "Subscriber failed");
                }
                Err(_) => {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    error!(subscriber = %id, event_type = %event.event_type, "Subscriber panicked");
                }
            }
        }
        delivered
    }

    /// Register a local subscriber. An empty list or `"*"` matches every type.
    pub async fn subscribe<I, S, H>(&self, event_types: I, handler: H) -> SubscriptionId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        H: EventHandler + 'static,
    {
        let id = SubscriptionId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let patterns: Vec<String> = event_types.into_iter().map(Into::into).collect();
        debug!(subscriber = %id, patterns = ?patterns, "Local subscriber added");
        self.subscribers.write().await.push(LocalSubscriber {
            id,
            patterns,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a local subscriber. `false` if it was not registered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Start a durable consumer-group subscription using the configured
    /// consumer defaults for everything but batch size and retries.
    pub async fn subscribe_persistent<H>(
        &self,
        event_types: Vec<String>,
        consumer_group: &str,
        consumer_name: &str,
        handler: H,
        batch_size: usize,
        max_retries: u32,
    ) -> Result<Uuid>
    where
        H: ConsumerHandler + 'static,
    {
        let config = self
            .consumer_defaults
            .consumer_config(consumer_group, consumer_name, event_types)
            .with_batch_size(batch_size)
            .with_max_retries(max_retries);
        self.subscribe_persistent_with(config, handler).await
    }

    /// Start a durable subscription with a full consumer config.
    pub async fn subscribe_persistent_with<H>(&self, config: ConsumerConfig, handler: H) -> Result<Uuid>
    where
        H: ConsumerHandler + 'static,
    {
        self.ensure_running().await?;
        let store = self.require_store()?;

        let wrapped = MigratingHandler {
            registry: self.registry.clone(),
            inner: Arc::new(handler),
        };
        let subscription = store.subscribe(config, Arc::new(wrapped)).await?;
        let id = subscription.id();
        info!(
            subscription_id = %id,
            consumer_group = %subscription.consumer_group(),
            "Persistent subscription started"
        );
        self.persistent.lock().await.insert(id, subscription);
        Ok(id)
    }

    /// Cancel a durable subscription and wait for its loop to stop.
    ///
    /// Returns the loop's error if it had already given up on the backend.
    pub async fn unsubscribe_persistent(&self, id: Uuid) -> Result<()> {
        let subscription = self
            .persistent
            .lock()
            .await
            .remove(&id)
            .ok_or(BusError::SubscriptionNotFound(id))?;
        subscription.shutdown().await?;
        info!(subscription_id = %id, "Persistent subscription stopped");
        Ok(())
    }

    /// Whether a durable subscription's loop is still running.
    pub async fn is_persistent_active(&self, id: Uuid) -> bool {
        self.persistent
            .lock()
            .await
            .get(&id)
            .is_some_and(|s| !s.is_finished())
    }

    /// Feed historical events through `handler`, migrated to current
    /// versions. Returns how many were handled successfully.
    pub async fn replay_events<F, Fut>(&self, filter: &EventFilter, handler: F) -> Result<usize>
    where
        F: Fn(StoredEvent) -> Fut,
        Fut: Future<Output = HandlerResult>,
    {
        self.ensure_running().await?;
        let events = self.require_store()?.query(filter).await?;

        let mut handled = 0;
        for stored in events {
            let stream_id = stored.stream_id;
            let migrated = match self.registry.migrate_stored(&stored) {
                Ok(migrated) => migrated,
                Err(e) => {
                    warn!(stream_id = %stream_id, event_type = %stored.event.event_type, error = %e, "Replay skipped event");
                    continue;
                }
            };
            match handler(migrated).await {
                Ok(()) => handled += 1,
                Err(e) => warn!(stream_id = %stream_id, error = %e, "Replay handler failed"),
            }
        }
        debug!(handled, "Replay finished");
        Ok(handled)
    }

    pub async fn trim_old_events(&self, max_age_days: u32, event_types: Option<&[String]>) -> Result<u64> {
        self.ensure_running().await?;
        Ok(self.require_store()?.trim_old_events(max_age_days, event_types).await?)
    }

    pub async fn get_pending_events(&self, consumer_group: &str, max_idle_ms: u64) -> Result<Vec<ConsumedEvent>> {
        self.ensure_running().await?;
        Ok(self
            .require_store()?
            .get_pending_events(consumer_group, max_idle_ms)
            .await?)
    }

    pub async fn replay_dlq(&self, consumer_group: &str, event_types: Option<&[String]>) -> Result<u64> {
        self.ensure_running().await?;
        let replayed = self.require_store()?.replay_dlq(consumer_group, event_types).await?;
        info!(consumer_group = %consumer_group, replayed, "Replayed dead letters");
        Ok(replayed)
    }

    pub async fn get_stats(&self) -> Result<BusStats> {
        self.ensure_running().await?;
        let stream = match &self.store {
            Some(store) => Some(store.get_stream_info().await?),
            None => None,
        };
        Ok(BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
            local_subscribers: self.subscribers.read().await.len(),
            persistent_subscriptions: self.persistent.lock().await.len(),
            stream,
        })
    }
}
