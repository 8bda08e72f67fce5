//! Durable consumer poll loop shared by every backend.
//!
//! Backends implement the claim primitives on [`EventStore`]; [`run`] drives
//! them: claim, deliver in order, ack / nack / dead-letter, idle-wait, and
//! back off on connection failures. Loops are spawned on a
//! [`SubscriptionSet`] so `disconnect` can cancel and await them all.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::BackoffBuilder;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::event_store::EventStore;
use super::types::{ConsumedEvent, ConsumerConfig};
use super::{Result, StoreError};
use crate::utils::retry::consumer_backoff;

/// Error returned by a consumer handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of handling one delivery.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Durable subscription handler.
///
/// Returning `Ok` acks the delivery. An `Err` or a panic is recorded as a
/// failed attempt.
pub trait ConsumerHandler: Send + Sync {
    fn handle(&self, event: ConsumedEvent) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> ConsumerHandler for F
where
    F: Fn(ConsumedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, event: ConsumedEvent) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(event))
    }
}

/// Handle to a running poll loop.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    consumer_group: String,
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Stop before the next claim cycle. Issued claims stay pending.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to end. A loop that gave up on the backend returns
    /// the last connection error.
    pub async fn join(self) -> Result<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Task(e.to_string())),
        }
    }

    /// Cancel and wait.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel();
        self.join().await
    }
}

struct SetInner {
    root: CancellationToken,
    tracker: TaskTracker,
}

impl SetInner {
    fn fresh() -> Self {
        Self {
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }
}

/// Poll loops started by one store.
///
/// Every subscription gets a child of the root token. `shutdown` cancels the
/// root and waits for every tracked task; the set is reusable afterwards.
pub struct SubscriptionSet {
    inner: Mutex<SetInner>,
}

impl Default for SubscriptionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SetInner::fresh()),
        }
    }

    /// Spawn [`run`] for `store` under this set.
    pub fn spawn<S>(&self, store: S, config: ConsumerConfig, handler: Arc<dyn ConsumerHandler>) -> Subscription
    where
        S: EventStore + 'static,
    {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let token = inner.root.child_token();
        let consumer_group = config.consumer_group.clone();
        let handle = inner.tracker.spawn(run(store, config, handler, token.clone()));

        Subscription {
            id: Uuid::new_v4(),
            consumer_group,
            token,
            handle,
        }
    }

    /// Number of poll loops still running.
    pub fn active(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).tracker.len()
    }

    /// Cancel every loop and wait for all of them to finish.
    pub async fn shutdown(&self) {
        let SetInner { root, tracker } = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *inner, SetInner::fresh())
        };
        root.cancel();
        tracker.close();
        tracker.wait().await;
    }
}

/// Drive one durable subscription until `token` is cancelled.
///
/// Handler failures never end the loop. The loop ends with an error only
/// after `max_retries` consecutive connection failures.
pub async fn run<S>(
    store: S,
    config: ConsumerConfig,
    handler: Arc<dyn ConsumerHandler>,
    token: CancellationToken,
) -> Result<()>
where
    S: EventStore,
{
    info!(
        backend = store.backend_name(),
        consumer_group = %config.consumer_group,
        consumer_name = %config.consumer_name,
        event_types = ?config.event_types,
        "Consumer started"
    );

    let mut backoff = consumer_backoff(&config).build();
    let mut failures: u32 = 0;

    while !token.is_cancelled() {
        match store.claim(&config).await {
            Ok(events) => {
                if failures > 0 {
                    info!(consumer_group = %config.consumer_group, "Consumer recovered");
                    failures = 0;
                    backoff = consumer_backoff(&config).build();
                }

                if events.is_empty() {
                    if !store.claim_blocks() {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = store.wait_for_events(&config, config.block_timeout()) => {}
                        }
                    }
                    continue;
                }

                let total = events.len();
                for (i, event) in events.into_iter().enumerate() {
                    if token.is_cancelled() {
                        debug!(
                            consumer_group = %config.consumer_group,
                            left_pending = total - i,
                            "Cancelled mid-batch"
                        );
                        break;
                    }
                    deliver(&store, handler.as_ref(), &config, event).await;
                }
            }
            Err(e) if e.is_connection() => {
                failures += 1;
                if failures > config.max_retries {
                    error!(
                        consumer_group = %config.consumer_group,
                        attempts = failures,
                        error = %e,
                        "Backend unreachable, consumer giving up"
                    );
                    return Err(e);
                }
                let delay = backoff.next().unwrap_or(MAX_BACKOFF);
                warn!(
                    consumer_group = %config.consumer_group,
                    attempt = failures,
                    max_retries = config.max_retries,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Claim failed, retrying"
                );
                if !sleep_or_cancel(&token, delay).await {
                    break;
                }
            }
            Err(e) => {
                warn!(consumer_group = %config.consumer_group, error = %e, "Claim failed");
                if !sleep_or_cancel(&token, config.retry_delay()).await {
                    break;
                }
            }
        }
    }

    info!(
        consumer_group = %config.consumer_group,
        consumer_name = %config.consumer_name,
        "Consumer stopped"
    );
    Ok(())
}

/// Upper bound for connection backoff.
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Sleep for `delay`; `false` if cancelled first.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Run the handler on one claimed event and settle the claim.
async fn deliver<S>(store: &S, handler: &dyn ConsumerHandler, config: &ConsumerConfig, event: ConsumedEvent)
where
    S: EventStore,
{
    let attempt = AssertUnwindSafe(async { handler.handle(event.clone()).await })
        .catch_unwind()
        .await;

    let failure = match attempt {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    };

    let Some(reason) = failure else {
        if let Err(e) = store.ack(&event).await {
            warn!(stream_id = %event.stream_id(), error = %e, "Ack failed");
        }
        return;
    };

    if event.delivery_count < config.dead_letter_after {
        warn!(
            event_type = %event.event_type(),
            stream_id = %event.stream_id(),
            consumer_group = %event.consumer_group,
            attempt = event.delivery_count,
            dead_letter_after = config.dead_letter_after,
            error = %reason,
            "Handler failed"
        );
        if let Err(e) = store.nack(&event, &reason).await {
            warn!(stream_id = %event.stream_id(), error = %e, "Nack failed");
        }
        return;
    }

    error!(
        event_type = %event.event_type(),
        stream_id = %event.stream_id(),
        consumer_group = %event.consumer_group,
        deliveries = event.delivery_count,
        error = %reason,
        "Delivery budget exhausted, dead-lettering"
    );
    match store.move_to_dlq(&event, &reason).await {
        Ok(()) => {
            if let Err(e) = store.ack(&event).await {
                warn!(stream_id = %event.stream_id(), error = %e, "Ack after dead-letter failed");
            }
        }
        Err(e) => {
            // Claim stays; the event is redelivered after the lease.
            error!(stream_id = %event.stream_id(), error = %e, "Dead-letter write failed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
