//! PostgreSQL event store.
//!
//! Events live in one table keyed by a `BIGSERIAL`. Appends issue
//! `pg_notify('events', ..)` in the same transaction and a background
//! [`PgListener`] turns those notifications into per-type wakeups, so idle
//! consumers block instead of polling.
//!
//! Appends hold a transaction-scoped advisory lock so ids become visible in
//! id order; group cursors never skip a row committed late. Claim cycles
//! hold a per-group advisory lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::consumer::{sleep_or_cancel, ConsumerHandler, Subscription, SubscriptionSet};
use super::types::{
    ConsumedEvent, ConsumerConfig, DlqEntry, EventFilter, PendingClaim, StoredEvent, StreamId,
    StreamInfo,
};
use super::wakeup::{combined_generation, wait_any, ClaimMarks, Wakeup};
use super::{EventStore, Result, StoreError};
use crate::event::{format_timestamp, Event, Payload};

mod schema;

/// Notification channel written by `append`.
pub const NOTIFY_CHANNEL: &str = "events";

/// Advisory lock key serializing appends. Arbitrary, but must not collide
/// with `hashtext(consumer_group)` in practice.
const APPEND_LOCK_KEY: i64 = 0x6576_656e_746c_696e;

const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

const EVENT_COLUMNS: &str =
    r#"id, event_id, event_type, event_data::text AS event_data, "timestamp", source, version"#;

const JOINED_COLUMNS: &str = r#"p.id AS pending_id, p.consumer_group, p.consumer_name, p.claimed_at,
    p.timeout_at, p.delivery_count, p.last_error, p.last_attempt,
    e.id, e.event_id, e.event_type, e.event_data::text AS event_data, e."timestamp", e.source, e.version"#;

/// Per-type wakeups fed by the listener.
#[derive(Default)]
struct Notifiers {
    any: Wakeup,
    by_type: Mutex<HashMap<String, Arc<Wakeup>>>,
}

impl Notifiers {
    fn for_type(&self, event_type: &str) -> Arc<Wakeup> {
        let mut by_type = self.by_type.lock().unwrap_or_else(|p| p.into_inner());
        by_type.entry(event_type.to_string()).or_default().clone()
    }

    fn wake(&self, event_type: &str) {
        if let Some(wakeup) = self
            .by_type
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(event_type)
        {
            wakeup.wake();
        }
        self.any.wake();
    }

    /// Wake everything. Used after a listener reconnect, when notifications
    /// may have been missed.
    fn wake_all(&self) {
        for wakeup in self.by_type.lock().unwrap_or_else(|p| p.into_inner()).values() {
            wakeup.wake();
        }
        self.any.wake();
    }

    /// Wakeups relevant to `config`, registering per-type ones on first use.
    fn watched(&self, config: &ConsumerConfig) -> Vec<Arc<Wakeup>> {
        config.event_types.iter().map(|t| self.for_type(t)).collect()
    }

    fn generation(&self, config: &ConsumerConfig) -> u64 {
        if config.event_types.is_empty() {
            return self.any.generation();
        }
        combined_generation(self.watched(config).iter().map(Arc::as_ref))
    }
}

struct ListenerTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    pool: PgPool,
    notifiers: Arc<Notifiers>,
    claim_marks: ClaimMarks,
    listener: tokio::sync::Mutex<Option<ListenerTask>>,
    subscriptions: SubscriptionSet,
}

/// PostgreSQL implementation of EventStore. Cloning shares the pool.
#[derive(Clone)]
pub struct PostgresEventStore {
    inner: Arc<Inner>,
}

impl PostgresEventStore {
    /// Create a store with a lazily connecting pool. Nothing touches the
    /// server until `connect`.
    pub fn new(uri: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_lazy(uri)?;
        Ok(Self::with_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                notifiers: Arc::new(Notifiers::default()),
                claim_marks: ClaimMarks::new(),
                listener: tokio::sync::Mutex::new(None),
                subscriptions: SubscriptionSet::new(),
            }),
        }
    }

    fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    async fn lock_appends(conn: &mut PgConnection) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn insert_event(conn: &mut PgConnection, event: &Event) -> Result<StreamId> {
        let row = sqlx::query(
            r#"INSERT INTO events (event_id, event_type, event_data, "timestamp", source, version)
               VALUES ($1, $2, $3::jsonb, $4, $5, $6)
               RETURNING id"#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.data_json()?)
        .bind(event.timestamp)
        .bind(&event.source)
        .bind(event.schema_version() as i32)
        .fetch_one(&mut *conn)
        .await?;
        let stream_id = seq_id(row.try_get("id")?);
        Self::notify(conn, stream_id, event).await?;
        Ok(stream_id)
    }

    async fn notify(conn: &mut PgConnection, stream_id: StreamId, event: &Event) -> Result<()> {
        let payload = json!({
            "stream_id": stream_id.to_string(),
            "event_id": event.event_id,
            "event_type": event.event_type,
            "timestamp": format_timestamp(&event.timestamp),
        });
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload.to_string())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn known_types(conn: &mut PgConnection) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT event_type FROM events ORDER BY event_type")
            .fetch_all(&mut *conn)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("event_type").map_err(StoreError::from))
            .collect()
    }

    async fn cursor(conn: &mut PgConnection, group: &str, event_type: &str) -> Result<StreamId> {
        let row = sqlx::query(
            "SELECT last_stream_id FROM event_consumer_positions
             WHERE group_name = $1 AND event_type = $2",
        )
        .bind(group)
        .bind(event_type)
        .fetch_optional(&mut *conn)
        .await?;
        match row {
            Some(row) => Ok(seq_id(row.try_get("last_stream_id")?)),
            None => Ok(StreamId::ZERO),
        }
    }

    /// Claim steps 2-4. Caller holds the group lock.
    async fn claim_in_tx(
        conn: &mut PgConnection,
        config: &ConsumerConfig,
        types: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<ConsumedEvent>> {
        let group = config.consumer_group.as_str();
        let lease = config.claim_timeout();
        let mut budget = config.batch_size.max(1);
        let mut claimed = Vec::new();

        for event_type in types {
            if budget == 0 {
                break;
            }
            let cursor = Self::cursor(conn, group, event_type).await?;

            let rows = sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM events e
                 WHERE e.event_type = $1 AND e.id > $2
                   AND NOT EXISTS (
                       SELECT 1 FROM event_pending p
                       WHERE p.stream_id = e.id AND p.consumer_group = $3)
                 ORDER BY e.id
                 LIMIT $4"
            ))
            .bind(event_type)
            .bind(cursor.seq() as i64)
            .bind(group)
            .bind(budget as i64)
            .fetch_all(&mut *conn)
            .await?;

            let mut last = None;
            for row in &rows {
                let stored = stored_from_row(row)?;
                let claim = PendingClaim::new(&stored, group, &config.consumer_name, now, lease);

                sqlx::query(
                    "INSERT INTO event_pending
                         (stream_id, consumer_group, consumer_name, claimed_at, timeout_at, delivery_count)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (stream_id, consumer_group) DO UPDATE SET
                         consumer_name = EXCLUDED.consumer_name,
                         claimed_at = EXCLUDED.claimed_at,
                         timeout_at = EXCLUDED.timeout_at,
                         delivery_count = EXCLUDED.delivery_count,
                         last_error = NULL,
                         last_attempt = NULL",
                )
                .bind(stored.stream_id.seq() as i64)
                .bind(group)
                .bind(&config.consumer_name)
                .bind(claim.claimed_at)
                .bind(claim.timeout_at)
                .bind(claim.delivery_count as i32)
                .execute(&mut *conn)
                .await?;

                last = Some(stored.stream_id);
                claimed.push(claim.to_consumed(stored));
                budget -= 1;
            }

            if let Some(position) = last {
                sqlx::query(
                    "INSERT INTO event_consumer_positions (group_name, event_type, last_stream_id)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (group_name, event_type) DO UPDATE SET
                         last_stream_id = EXCLUDED.last_stream_id",
                )
                .bind(group)
                .bind(event_type)
                .bind(position.seq() as i64)
                .execute(&mut *conn)
                .await?;
            }
        }

        if budget > 0 && !types.is_empty() {
            let retry_cutoff = now - chrono::Duration::milliseconds(config.retry_delay_ms as i64);
            let rows = sqlx::query(&format!(
                "SELECT {JOINED_COLUMNS}
                 FROM event_pending p JOIN events e ON e.id = p.stream_id
                 WHERE p.consumer_group = $1
                   AND e.event_type = ANY($2)
                   AND (p.timeout_at < $3
                        OR (p.last_attempt IS NOT NULL
                            AND p.last_attempt >= p.claimed_at
                            AND p.last_attempt <= $4))
                 ORDER BY p.stream_id
                 LIMIT $5"
            ))
            .bind(group)
            .bind(types)
            .bind(now)
            .bind(retry_cutoff)
            .bind(budget as i64)
            .fetch_all(&mut *conn)
            .await?;

            for row in &rows {
                let (pending_id, mut claim, stored) = claim_from_row(row)?;
                claim.reclaim(&config.consumer_name, now, lease);

                sqlx::query(
                    "UPDATE event_pending
                     SET consumer_name = $1, claimed_at = $2, timeout_at = $3, delivery_count = $4
                     WHERE id = $5",
                )
                .bind(&config.consumer_name)
                .bind(claim.claimed_at)
                .bind(claim.timeout_at)
                .bind(claim.delivery_count as i32)
                .bind(pending_id)
                .execute(&mut *conn)
                .await?;

                claimed.push(claim.to_consumed(stored));
            }
        }

        Ok(claimed)
    }

    /// Moves the original row to the end of the stream when it still
    /// exists, which keeps `event_id` unique. Returns the new stream id.
    async fn reappend(conn: &mut PgConnection, event: &Event) -> Result<StreamId> {
        let existing = sqlx::query("SELECT id FROM events WHERE event_id = $1")
            .bind(&event.event_id)
            .fetch_optional(&mut *conn)
            .await?;

        let Some(row) = existing else {
            return Self::insert_event(conn, event).await;
        };
        let old_id: i64 = row.try_get("id")?;

        sqlx::query("DELETE FROM event_pending WHERE stream_id = $1")
            .bind(old_id)
            .execute(&mut *conn)
            .await?;
        let row = sqlx::query(
            "UPDATE events SET id = nextval(pg_get_serial_sequence('events', 'id'))
             WHERE id = $1
             RETURNING id",
        )
        .bind(old_id)
        .fetch_one(&mut *conn)
        .await?;
        let stream_id = seq_id(row.try_get("id")?);
        Self::notify(conn, stream_id, event).await?;
        Ok(stream_id)
    }

    async fn replay_in_tx(
        conn: &mut PgConnection,
        consumer_group: &str,
        event_types: Option<&[String]>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id, original_stream_id, event_data::text AS event_data FROM event_dlq
             WHERE consumer_group = $1 AND NOT replayed
             ORDER BY id
             FOR UPDATE",
        )
        .bind(consumer_group)
        .fetch_all(&mut *conn)
        .await?;

        let mut replayed = Vec::new();
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let payload = payload_from_json(&row.try_get::<String, _>("event_data")?)?;
            let event = Event::from_payload(payload)?;
            if event_types.is_some_and(|types| !types.contains(&event.event_type)) {
                continue;
            }

            let stream_id = Self::reappend(conn, &event).await?;
            sqlx::query("UPDATE event_dlq SET replayed = TRUE WHERE id = $1")
                .bind(id)
                .execute(&mut *conn)
                .await?;

            debug!(
                original_stream_id = row.try_get::<i64, _>("original_stream_id")?,
                stream_id = %stream_id,
                "Replayed dead letter"
            );
            replayed.push(event.event_type);
        }
        Ok(replayed)
    }

    async fn start_listener(&self) {
        let mut slot = self.inner.listener.lock().await;
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(listen(
            self.pool().clone(),
            self.inner.notifiers.clone(),
            token.clone(),
        ));
        *slot = Some(ListenerTask { token, handle });
    }

    async fn stop_listener(&self) {
        let task = self.inner.listener.lock().await.take();
        if let Some(task) = task {
            task.token.cancel();
            let _ = task.handle.await;
        }
    }
}

/// Forward notifications to waiters until cancelled, reconnecting with
/// doubling delay after failures.
async fn listen(pool: PgPool, notifiers: Arc<Notifiers>, token: CancellationToken) {
    let mut listener: Option<PgListener> = None;
    let mut reconnect_delay = MIN_RECONNECT_DELAY;

    loop {
        if listener.is_none() {
            match open_listener(&pool).await {
                Ok(opened) => {
                    info!(channel = NOTIFY_CHANNEL, "Listening for event notifications");
                    reconnect_delay = MIN_RECONNECT_DELAY;
                    listener = Some(opened);
                    notifiers.wake_all();
                }
                Err(e) => {
                    error!(
                        error = %e,
                        delay_secs = reconnect_delay.as_secs(),
                        "Failed to start notification listener, retrying"
                    );
                    if !sleep_or_cancel(&token, reconnect_delay).await {
                        break;
                    }
                    reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                    continue;
                }
            }
        }
        let Some(active) = listener.as_mut() else {
            continue;
        };

        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = active.recv() => received,
        };

        match received {
            Ok(notification) => match event_type_of(notification.payload()) {
                Some(event_type) => notifiers.wake(&event_type),
                None => {
                    warn!(payload = notification.payload(), "Unreadable event notification");
                    notifiers.wake_all();
                }
            },
            Err(e) => {
                warn!(error = %e, "Notification listener dropped, reconnecting");
                listener = None;
                notifiers.wake_all();
                if !sleep_or_cancel(&token, reconnect_delay).await {
                    break;
                }
                reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
            }
        }
    }

    debug!("Notification listener stopped");
}

async fn open_listener(pool: &PgPool) -> Result<PgListener> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(NOTIFY_CHANNEL).await?;
    Ok(listener)
}

fn event_type_of(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value.get("event_type")?.as_str().map(str::to_string)
}

fn seq_id(raw: i64) -> StreamId {
    StreamId::from_seq(u64::try_from(raw).unwrap_or_default())
}

fn payload_from_json(raw: &str) -> Result<Payload> {
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::InvalidEvent("event_data is not a JSON object".into())),
    }
}

fn stored_from_row(row: &PgRow) -> Result<StoredEvent> {
    let version: i32 = row.try_get("version")?;
    Ok(StoredEvent {
        stream_id: seq_id(row.try_get("id")?),
        event: Event {
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            timestamp: row.try_get("timestamp")?,
            source: row.try_get("source")?,
            version: u32::try_from(version).ok(),
            data: payload_from_json(&row.try_get::<String, _>("event_data")?)?,
        },
    })
}

fn claim_from_row(row: &PgRow) -> Result<(i64, PendingClaim, StoredEvent)> {
    let stored = stored_from_row(row)?;
    let delivery_count: i32 = row.try_get("delivery_count")?;
    let claim = PendingClaim {
        stream_id: stored.stream_id,
        event_type: stored.event.event_type.clone(),
        consumer_group: row.try_get("consumer_group")?,
        consumer_name: row.try_get("consumer_name")?,
        claimed_at: row.try_get("claimed_at")?,
        timeout_at: row.try_get("timeout_at")?,
        delivery_count: u32::try_from(delivery_count).unwrap_or_default(),
        last_error: row.try_get("last_error")?,
        last_attempt: row.try_get("last_attempt")?,
    };
    Ok((row.try_get("pending_id")?, claim, stored))
}

fn claim_not_found(event: &ConsumedEvent) -> StoreError {
    StoreError::ClaimNotFound {
        stream_id: event.stream_id(),
        consumer_group: event.consumer_group.clone(),
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> Result<()> {
        if self.pool().is_closed() {
            return Err(StoreError::NotConnected);
        }
        for statement in schema::create_statements() {
            sqlx::query(&statement).execute(self.pool()).await?;
        }
        self.start_listener().await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.subscriptions.shutdown().await;
        self.stop_listener().await;
        self.pool().close().await;
        Ok(())
    }

    async fn append(&self, event: &Event) -> Result<StreamId> {
        let mut tx = self.pool().begin().await?;
        Self::lock_appends(&mut *tx).await?;
        let stream_id = Self::insert_event(&mut *tx, event).await?;
        tx.commit().await?;

        // Local waiters need not wait for the listener round trip.
        self.inner.notifiers.wake(&event.event_type);
        debug!(event_type = %event.event_type, stream_id = %stream_id, "Appended event");
        Ok(stream_id)
    }

    async fn get_event(&self, stream_id: StreamId) -> Result<Option<StoredEvent>> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(stream_id.seq() as i64)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(stored_from_row).transpose()
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE TRUE"));

        if !filter.event_types.is_empty() {
            builder
                .push(" AND event_type = ANY(")
                .push_bind(filter.event_types.clone())
                .push(")");
        }
        if let Some(start) = filter.start_time {
            builder.push(r#" AND "timestamp" >= "#).push_bind(start);
        }
        if let Some(end) = filter.end_time {
            builder.push(r#" AND "timestamp" <= "#).push_bind(end);
        }
        if let Some(start) = filter.start_id {
            builder.push(" AND id >= ").push_bind(start.seq() as i64);
        }
        if let Some(end) = filter.end_id {
            builder.push(" AND id <= ").push_bind(end.seq() as i64);
        }
        if let Some(pattern) = filter.source_like() {
            builder
                .push(" AND source LIKE ")
                .push_bind(pattern)
                .push(r" ESCAPE '\'");
        }
        builder.push(" ORDER BY id");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.iter().map(stored_from_row).collect()
    }

    async fn subscribe(
        &self,
        config: ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription> {
        if self.pool().is_closed() {
            return Err(StoreError::NotConnected);
        }
        Ok(self.inner.subscriptions.spawn(self.clone(), config, handler))
    }

    async fn claim(&self, config: &ConsumerConfig) -> Result<Vec<ConsumedEvent>> {
        self.inner
            .claim_marks
            .record(config, self.inner.notifiers.generation(config));
        let mut tx = self.pool().begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(&config.consumer_group)
            .execute(&mut *tx)
            .await?;

        let types = if config.event_types.is_empty() {
            Self::known_types(&mut *tx).await?
        } else {
            config.event_types.clone()
        };
        let claimed = Self::claim_in_tx(&mut *tx, config, &types, Utc::now()).await?;
        tx.commit().await?;
        Ok(claimed)
    }

    async fn wait_for_events(&self, config: &ConsumerConfig, timeout: Duration) {
        let notifiers = &self.inner.notifiers;
        let seen = self.inner.claim_marks.last(config);
        if config.event_types.is_empty() {
            wait_any(&[&notifiers.any], seen, timeout).await;
            return;
        }

        let watched = notifiers.watched(config);
        let wakeups: Vec<&Wakeup> = watched.iter().map(Arc::as_ref).collect();
        wait_any(&wakeups, seen, timeout).await;
    }

    async fn ack(&self, event: &ConsumedEvent) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM event_pending WHERE stream_id = $1 AND consumer_group = $2")
            .bind(event.stream_id().seq() as i64)
            .bind(&event.consumer_group)
            .execute(self.pool())
            .await?
            .rows_affected();

        if deleted > 0 {
            sqlx::query(
                "INSERT INTO event_consumer_groups (group_name, consumer_name, last_event_id, last_processed_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (group_name, consumer_name) DO UPDATE SET
                     last_event_id = GREATEST(event_consumer_groups.last_event_id, EXCLUDED.last_event_id),
                     last_processed_at = EXCLUDED.last_processed_at",
            )
            .bind(&event.consumer_group)
            .bind(&event.consumer_name)
            .bind(event.stream_id().seq() as i64)
            .bind(Utc::now())
            .execute(self.pool())
            .await?;
            return Ok(());
        }

        let mut conn = self.pool().acquire().await?;
        let cursor = Self::cursor(&mut conn, &event.consumer_group, event.event_type()).await?;
        if event.stream_id() <= cursor {
            Ok(())
        } else {
            Err(claim_not_found(event))
        }
    }

    async fn nack(&self, event: &ConsumedEvent, reason: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE event_pending
             SET delivery_count = delivery_count + 1, last_error = $1, last_attempt = $2
             WHERE stream_id = $3 AND consumer_group = $4",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(event.stream_id().seq() as i64)
        .bind(&event.consumer_group)
        .execute(self.pool())
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(claim_not_found(event));
        }
        Ok(())
    }

    async fn extend_timeout(&self, event: &ConsumedEvent, seconds: u64) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {JOINED_COLUMNS}
             FROM event_pending p JOIN events e ON e.id = p.stream_id
             WHERE p.stream_id = $1 AND p.consumer_group = $2
             FOR UPDATE OF p"
        ))
        .bind(event.stream_id().seq() as i64)
        .bind(&event.consumer_group)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| claim_not_found(event))?;

        let (pending_id, mut claim, _) = claim_from_row(&row)?;
        claim.extend(seconds, Utc::now());

        sqlx::query("UPDATE event_pending SET timeout_at = $1 WHERE id = $2")
            .bind(claim.timeout_at)
            .bind(pending_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_pending_events(
        &self,
        consumer_group: &str,
        max_idle_ms: u64,
    ) -> Result<Vec<ConsumedEvent>> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(max_idle_ms as i64);
        let rows = sqlx::query(&format!(
            "SELECT {JOINED_COLUMNS}
             FROM event_pending p JOIN events e ON e.id = p.stream_id
             WHERE p.consumer_group = $1 AND p.claimed_at <= $2
             ORDER BY p.stream_id"
        ))
        .bind(consumer_group)
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let (_, claim, stored) = claim_from_row(row)?;
                Ok(claim.to_consumed(stored))
            })
            .collect()
    }

    async fn move_to_dlq(&self, event: &ConsumedEvent, reason: &str) -> Result<()> {
        let entry = DlqEntry::from_consumed(String::new(), event, reason);
        sqlx::query(
            "INSERT INTO event_dlq
                 (original_stream_id, event_data, failure_reason, failure_time, delivery_count, consumer_group)
             VALUES ($1, $2::jsonb, $3, $4, $5, $6)",
        )
        .bind(entry.original_stream_id.seq() as i64)
        .bind(serde_json::to_string(&entry.event_payload)?)
        .bind(&entry.failure_reason)
        .bind(entry.failure_time)
        .bind(entry.delivery_count as i32)
        .bind(&entry.consumer_group)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn replay_dlq(&self, consumer_group: &str, event_types: Option<&[String]>) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        Self::lock_appends(&mut *tx).await?;
        let replayed = Self::replay_in_tx(&mut *tx, consumer_group, event_types).await?;
        tx.commit().await?;

        for event_type in &replayed {
            self.inner.notifiers.wake(event_type);
        }
        Ok(replayed.len() as u64)
    }

    async fn get_stream_info(&self) -> Result<StreamInfo> {
        let mut info = StreamInfo {
            backend: self.backend_name().to_string(),
            ..StreamInfo::default()
        };

        let rows = sqlx::query("SELECT event_type, COUNT(*) AS n FROM events GROUP BY event_type")
            .fetch_all(self.pool())
            .await?;
        for row in rows {
            let n: i64 = row.try_get("n")?;
            info.events_per_type.insert(row.try_get("event_type")?, n as u64);
        }
        info.total_events = info.events_per_type.values().sum();

        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM event_pending")
            .fetch_one(self.pool())
            .await?
            .try_get("n")?;
        info.pending_count = n as u64;

        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM event_dlq WHERE NOT replayed")
            .fetch_one(self.pool())
            .await?
            .try_get("n")?;
        info.dlq_count = n as u64;

        let rows = sqlx::query("SELECT DISTINCT group_name FROM event_consumer_positions ORDER BY group_name")
            .fetch_all(self.pool())
            .await?;
        for row in rows {
            info.consumer_groups.push(row.try_get("group_name")?);
        }

        Ok(info)
    }

    async fn trim_old_events(&self, max_age_days: u32, event_types: Option<&[String]>) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let types: Option<Vec<String>> = event_types.map(<[String]>::to_vec);

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"DELETE FROM event_pending WHERE stream_id IN (
                   SELECT id FROM events
                   WHERE "timestamp" < $1 AND ($2::text[] IS NULL OR event_type = ANY($2)))"#,
        )
        .bind(cutoff)
        .bind(&types)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query(
            r#"DELETE FROM events
               WHERE "timestamp" < $1 AND ($2::text[] IS NULL OR event_type = ANY($2))"#,
        )
        .bind(cutoff)
        .bind(&types)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        info!(removed, cutoff = %format_timestamp(&cutoff), "Trimmed old events");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_of_notification() {
        let payload = r#"{"stream_id":"7-0","event_id":"e1","event_type":"asset.removed","timestamp":"2024-01-01T00:00:00.000000Z"}"#;
        assert_eq!(event_type_of(payload).as_deref(), Some("asset.removed"));
        assert_eq!(event_type_of("not json"), None);
        assert_eq!(event_type_of(r#"{"stream_id":"7-0"}"#), None);
    }

    #[test]
    fn test_schema_statements_cover_every_table() {
        let ddl = schema::create_statements().join(";\n");
        for table in ["events", "event_consumer_groups", "event_consumer_positions", "event_pending", "event_dlq"] {
            assert!(ddl.contains(&format!("\"{}\"", table)), "missing {}", table);
        }
        assert!(ddl.contains("jsonb"));
        assert!(ddl.contains("bigserial"));
    }

    #[tokio::test]
    async fn test_wake_reaches_type_waiter() {
        let notifiers = Arc::new(Notifiers::default());
        let config = ConsumerConfig::new("g", "c", ["asset.removed"]);
        let seen = notifiers.generation(&config);
        let waiter = {
            let notifiers = notifiers.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let started = std::time::Instant::now();
                let watched = notifiers.watched(&config);
                let wakeups: Vec<&Wakeup> = watched.iter().map(Arc::as_ref).collect();
                wait_any(&wakeups, Some(seen), Duration::from_secs(2)).await;
                started.elapsed() < Duration::from_secs(1)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        notifiers.wake("asset.removed");
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_generation_tracks_watched_types_only() {
        let notifiers = Notifiers::default();
        let config = ConsumerConfig::new("g", "c", ["asset.removed"]);
        let before = notifiers.generation(&config);

        notifiers.wake("tags.updated");
        assert_eq!(notifiers.generation(&config), before);

        notifiers.wake("asset.removed");
        assert_ne!(notifiers.generation(&config), before);
    }
}
