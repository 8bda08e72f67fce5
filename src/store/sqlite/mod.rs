//! SQLite event store.
//!
//! A single database file in WAL mode. Every claim cycle and multi-statement
//! write runs inside `BEGIN IMMEDIATE`, which takes the write lock upfront so
//! concurrent consumers serialize instead of racing to upgrade a deferred
//! transaction.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Alias, Cond, Expr, OnConflict, Order, Query, SelectStatement, SqliteQueryBuilder};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use super::consumer::{ConsumerHandler, Subscription, SubscriptionSet};
use super::types::{
    ConsumedEvent, ConsumerConfig, DlqEntry, EventFilter, PendingClaim, StoredEvent, StreamId,
    StreamInfo,
};
use super::wakeup::{wait_any, ClaimMarks, Wakeup};
use super::{EventStore, Result, StoreError};
use crate::event::{format_timestamp, parse_timestamp, Event, Payload};

mod schema;

use schema::{ConsumerPositions, DlqEvents, Events, PendingEvents};

const MAX_CONNECTIONS: u32 = 5;

struct Inner {
    pool: SqlitePool,
    appended: Wakeup,
    claim_marks: ClaimMarks,
    subscriptions: SubscriptionSet,
}

/// SQLite implementation of EventStore. Cloning shares the pool.
#[derive(Clone)]
pub struct SqliteEventStore {
    inner: Arc<Inner>,
}

impl SqliteEventStore {
    /// Wrap an existing pool. Call `connect` to create the schema.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                appended: Wakeup::new(),
                claim_marks: ClaimMarks::new(),
                subscriptions: SubscriptionSet::new(),
            }),
        }
    }

    /// Open (or create) a database file and its schema.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.connect().await?;
        info!(path, "Opened SQLite event store");
        Ok(store)
    }

    /// Private in-memory database. One connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.connect().await?;
        Ok(store)
    }

    fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    async fn begin_immediate(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(())
    }

    async fn finish<T>(conn: &mut SqliteConnection, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(value)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    fn insert_event_sql(event: &Event) -> Result<String> {
        Ok(Query::insert()
            .into_table(Events::Table)
            .columns([
                Events::EventId,
                Events::EventType,
                Events::EventData,
                Events::Timestamp,
                Events::Source,
                Events::Version,
            ])
            .values_panic([
                event.event_id.clone().into(),
                event.event_type.clone().into(),
                event.data_json()?.into(),
                format_timestamp(&event.timestamp).into(),
                event.source.clone().into(),
                i64::from(event.schema_version()).into(),
            ])
            .to_string(SqliteQueryBuilder))
    }

    /// Event types present in the store, for subscriptions without a type list.
    async fn known_types(conn: &mut SqliteConnection) -> Result<Vec<String>> {
        let query = Query::select()
            .distinct()
            .column(Events::EventType)
            .from(Events::Table)
            .order_by(Events::EventType, Order::Asc)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("event_type").map_err(StoreError::from))
            .collect()
    }

    async fn cursor(conn: &mut SqliteConnection, group: &str, event_type: &str) -> Result<StreamId> {
        let query = Query::select()
            .column(ConsumerPositions::LastStreamId)
            .from(ConsumerPositions::Table)
            .and_where(Expr::col(ConsumerPositions::GroupName).eq(group))
            .and_where(Expr::col(ConsumerPositions::EventType).eq(event_type))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        match row {
            Some(row) => Ok(seq_id(row.try_get("last_stream_id")?)),
            None => Ok(StreamId::ZERO),
        }
    }

    /// Claim steps 2-4. Caller holds the write lock.
    async fn claim_in_tx(
        conn: &mut SqliteConnection,
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

            let query = Query::select()
                .columns(EVENT_COLUMNS)
                .from(Events::Table)
                .and_where(Expr::col(Events::EventType).eq(event_type.as_str()))
                .and_where(Expr::col(Events::StreamId).gt(cursor.seq() as i64))
                .and_where(
                    Expr::col(Events::StreamId).not_in_subquery(
                        Query::select()
                            .column(PendingEvents::StreamId)
                            .from(PendingEvents::Table)
                            .and_where(Expr::col(PendingEvents::ConsumerGroup).eq(group))
                            .to_owned(),
                    ),
                )
                .order_by(Events::StreamId, Order::Asc)
                .limit(budget as u64)
                .to_string(SqliteQueryBuilder);
            let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;

            let mut last = None;
            for row in &rows {
                let stored = stored_from_row(row)?;
                let claim = PendingClaim::new(&stored, group, &config.consumer_name, now, lease);

                let upsert = Query::insert()
                    .into_table(PendingEvents::Table)
                    .columns([
                        PendingEvents::StreamId,
                        PendingEvents::ConsumerGroup,
                        PendingEvents::ConsumerName,
                        PendingEvents::ClaimedAt,
                        PendingEvents::TimeoutAt,
                        PendingEvents::DeliveryCount,
                    ])
                    .values_panic([
                        (stored.stream_id.seq() as i64).into(),
                        group.into(),
                        config.consumer_name.as_str().into(),
                        format_timestamp(&claim.claimed_at).into(),
                        format_timestamp(&claim.timeout_at).into(),
                        i64::from(claim.delivery_count).into(),
                    ])
                    .on_conflict(
                        OnConflict::columns([PendingEvents::StreamId, PendingEvents::ConsumerGroup])
                            .update_columns([
                                PendingEvents::ConsumerName,
                                PendingEvents::ClaimedAt,
                                PendingEvents::TimeoutAt,
                                PendingEvents::DeliveryCount,
                                PendingEvents::LastError,
                                PendingEvents::LastAttempt,
                            ])
                            .to_owned(),
                    )
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&upsert).execute(&mut *conn).await?;

                last = Some(stored.stream_id);
                claimed.push(claim.to_consumed(stored));
                budget -= 1;
            }

            if let Some(position) = last {
                let query = Query::insert()
                    .into_table(ConsumerPositions::Table)
                    .columns([
                        ConsumerPositions::GroupName,
                        ConsumerPositions::EventType,
                        ConsumerPositions::LastStreamId,
                    ])
                    .values_panic([
                        group.into(),
                        event_type.as_str().into(),
                        (position.seq() as i64).into(),
                    ])
                    .on_conflict(
                        OnConflict::columns([ConsumerPositions::GroupName, ConsumerPositions::EventType])
                            .update_column(ConsumerPositions::LastStreamId)
                            .to_owned(),
                    )
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&query).execute(&mut *conn).await?;
            }
        }

        if budget > 0 && !types.is_empty() {
            let retry_cutoff = now - chrono::Duration::milliseconds(config.retry_delay_ms as i64);
            let query = pending_select()
                .and_where(Expr::col((PendingEvents::Table, PendingEvents::ConsumerGroup)).eq(group))
                .and_where(Expr::col((Events::Table, Events::EventType)).is_in(types.iter().cloned()))
                .cond_where(
                    Cond::any()
                        .add(
                            Expr::col((PendingEvents::Table, PendingEvents::TimeoutAt))
                                .lt(format_timestamp(&now)),
                        )
                        .add(
                            Cond::all()
                                .add(Expr::col((PendingEvents::Table, PendingEvents::LastAttempt)).is_not_null())
                                .add(
                                    Expr::col((PendingEvents::Table, PendingEvents::LastAttempt))
                                        .gte(Expr::col((PendingEvents::Table, PendingEvents::ClaimedAt))),
                                )
                                .add(
                                    Expr::col((PendingEvents::Table, PendingEvents::LastAttempt))
                                        .lte(format_timestamp(&retry_cutoff)),
                                ),
                        ),
                )
                .order_by((PendingEvents::Table, PendingEvents::StreamId), Order::Asc)
                .limit(budget as u64)
                .to_string(SqliteQueryBuilder);
            let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;

            for row in &rows {
                let (pending_id, mut claim, stored) = claim_from_row(row)?;
                claim.reclaim(&config.consumer_name, now, lease);

                let update = Query::update()
                    .table(PendingEvents::Table)
                    .values([
                        (PendingEvents::ConsumerName, config.consumer_name.as_str().into()),
                        (PendingEvents::ClaimedAt, format_timestamp(&claim.claimed_at).into()),
                        (PendingEvents::TimeoutAt, format_timestamp(&claim.timeout_at).into()),
                        (PendingEvents::DeliveryCount, i64::from(claim.delivery_count).into()),
                    ])
                    .and_where(Expr::col(PendingEvents::Id).eq(pending_id))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&update).execute(&mut *conn).await?;

                claimed.push(claim.to_consumed(stored));
            }
        }

        Ok(claimed)
    }

    async fn replay_in_tx(
        conn: &mut SqliteConnection,
        consumer_group: &str,
        event_types: Option<&[String]>,
    ) -> Result<u64> {
        let query = Query::select()
            .columns([DlqEvents::Id, DlqEvents::OriginalStreamId, DlqEvents::EventData])
            .from(DlqEvents::Table)
            .and_where(Expr::col(DlqEvents::ConsumerGroup).eq(consumer_group))
            .and_where(Expr::col(DlqEvents::Replayed).eq(0))
            .order_by(DlqEvents::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;

        let mut replayed = 0;
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let payload = payload_from_json(&row.try_get::<String, _>("event_data")?)?;
            let event = Event::from_payload(payload)?;
            if event_types.is_some_and(|types| !types.contains(&event.event_type)) {
                continue;
            }

            let result = sqlx::query(&Self::insert_event_sql(&event)?)
                .execute(&mut *conn)
                .await?;
            let mark = Query::update()
                .table(DlqEvents::Table)
                .value(DlqEvents::Replayed, 1)
                .and_where(Expr::col(DlqEvents::Id).eq(id))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&mark).execute(&mut *conn).await?;

            debug!(
                original_stream_id = row.try_get::<i64, _>("original_stream_id")?,
                stream_id = result.last_insert_rowid(),
                "Replayed dead letter"
            );
            replayed += 1;
        }
        Ok(replayed)
    }

    async fn extend_in_tx(conn: &mut SqliteConnection, event: &ConsumedEvent, seconds: u64) -> Result<()> {
        let query = pending_select()
            .and_where(Expr::col((PendingEvents::Table, PendingEvents::StreamId)).eq(event.stream_id().seq() as i64))
            .and_where(
                Expr::col((PendingEvents::Table, PendingEvents::ConsumerGroup)).eq(event.consumer_group.as_str()),
            )
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| claim_not_found(event))?;

        let (pending_id, mut claim, _) = claim_from_row(&row)?;
        claim.extend(seconds, Utc::now());

        let update = Query::update()
            .table(PendingEvents::Table)
            .value(PendingEvents::TimeoutAt, format_timestamp(&claim.timeout_at))
            .and_where(Expr::col(PendingEvents::Id).eq(pending_id))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&update).execute(&mut *conn).await?;
        Ok(())
    }

    /// Statements deleting claims on trimmed events, then the events.
    fn trim_statements(cutoff: &DateTime<Utc>, event_types: Option<&[String]>) -> (String, String) {
        let mut cond = Cond::all().add(Expr::col(Events::Timestamp).lt(format_timestamp(cutoff)));
        if let Some(types) = event_types {
            cond = cond.add(Expr::col(Events::EventType).is_in(types.iter().cloned()));
        }
        let victims = Query::select()
            .column(Events::StreamId)
            .from(Events::Table)
            .cond_where(cond.clone())
            .to_owned();
        let claims = Query::delete()
            .from_table(PendingEvents::Table)
            .and_where(Expr::col(PendingEvents::StreamId).in_subquery(victims))
            .to_string(SqliteQueryBuilder);
        let events = Query::delete()
            .from_table(Events::Table)
            .cond_where(cond)
            .to_string(SqliteQueryBuilder);
        (claims, events)
    }

    async fn trim_in_tx(conn: &mut SqliteConnection, claims: &str, events: &str) -> Result<u64> {
        sqlx::query(claims).execute(&mut *conn).await?;
        Ok(sqlx::query(events).execute(&mut *conn).await?.rows_affected())
    }
}

const EVENT_COLUMNS: [Events; 7] = [
    Events::StreamId,
    Events::EventId,
    Events::EventType,
    Events::EventData,
    Events::Timestamp,
    Events::Source,
    Events::Version,
];

fn query_sql(filter: &EventFilter) -> String {
    let mut select = Query::select();
    select.columns(EVENT_COLUMNS).from(Events::Table);

    if !filter.event_types.is_empty() {
        select.and_where(Expr::col(Events::EventType).is_in(filter.event_types.iter().cloned()));
    }
    if let Some(start) = &filter.start_time {
        select.and_where(Expr::col(Events::Timestamp).gte(format_timestamp(start)));
    }
    if let Some(end) = &filter.end_time {
        select.and_where(Expr::col(Events::Timestamp).lte(format_timestamp(end)));
    }
    if let Some(start) = filter.start_id {
        select.and_where(Expr::col(Events::StreamId).gte(start.seq() as i64));
    }
    if let Some(end) = filter.end_id {
        select.and_where(Expr::col(Events::StreamId).lte(end.seq() as i64));
    }
    // LIKE folds ASCII case in SQLite; GLOB does not.
    if let Some(pattern) = filter.source_glob() {
        select.and_where(Expr::cust_with_values(r#""source" GLOB ?"#, [pattern]));
    }
    select.order_by(Events::StreamId, Order::Asc);
    if let Some(limit) = filter.limit {
        select.limit(limit as u64);
    }
    select.to_string(SqliteQueryBuilder)
}

/// Claims joined with their events.
fn pending_select() -> SelectStatement {
    Query::select()
        .expr_as(
            Expr::col((PendingEvents::Table, PendingEvents::Id)),
            Alias::new("pending_id"),
        )
        .columns([
            (PendingEvents::Table, PendingEvents::ConsumerGroup),
            (PendingEvents::Table, PendingEvents::ConsumerName),
            (PendingEvents::Table, PendingEvents::ClaimedAt),
            (PendingEvents::Table, PendingEvents::TimeoutAt),
            (PendingEvents::Table, PendingEvents::DeliveryCount),
            (PendingEvents::Table, PendingEvents::LastError),
            (PendingEvents::Table, PendingEvents::LastAttempt),
        ])
        .columns(EVENT_COLUMNS.map(|c| (Events::Table, c)))
        .from(PendingEvents::Table)
        .inner_join(
            Events::Table,
            Expr::col((Events::Table, Events::StreamId)).equals((PendingEvents::Table, PendingEvents::StreamId)),
        )
        .to_owned()
}

fn seq_id(raw: i64) -> StreamId {
    StreamId::from_seq(u64::try_from(raw).unwrap_or_default())
}

fn time_from_sql(raw: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(raw).map_err(|e| StoreError::InvalidEvent(format!("bad timestamp {:?}: {}", raw, e)))
}

fn payload_from_json(raw: &str) -> Result<Payload> {
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::InvalidEvent("event_data is not a JSON object".into())),
    }
}

fn stored_from_row(row: &SqliteRow) -> Result<StoredEvent> {
    let version: i64 = row.try_get("version")?;
    Ok(StoredEvent {
        stream_id: seq_id(row.try_get("stream_id")?),
        event: Event {
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            timestamp: time_from_sql(&row.try_get::<String, _>("timestamp")?)?,
            source: row.try_get("source")?,
            version: u32::try_from(version).ok(),
            data: payload_from_json(&row.try_get::<String, _>("event_data")?)?,
        },
    })
}

fn claim_from_row(row: &SqliteRow) -> Result<(i64, PendingClaim, StoredEvent)> {
    let stored = stored_from_row(row)?;
    let last_attempt: Option<String> = row.try_get("last_attempt")?;
    let delivery_count: i64 = row.try_get("delivery_count")?;
    let claim = PendingClaim {
        stream_id: stored.stream_id,
        event_type: stored.event.event_type.clone(),
        consumer_group: row.try_get("consumer_group")?,
        consumer_name: row.try_get("consumer_name")?,
        claimed_at: time_from_sql(&row.try_get::<String, _>("claimed_at")?)?,
        timeout_at: time_from_sql(&row.try_get::<String, _>("timeout_at")?)?,
        delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        last_attempt: last_attempt.as_deref().map(time_from_sql).transpose()?,
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
impl EventStore for SqliteEventStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(&self) -> Result<()> {
        if self.pool().is_closed() {
            return Err(StoreError::NotConnected);
        }
        for statement in schema::create_statements() {
            sqlx::query(&statement).execute(self.pool()).await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.subscriptions.shutdown().await;
        self.pool().close().await;
        Ok(())
    }

    async fn append(&self, event: &Event) -> Result<StreamId> {
        let result = sqlx::query(&Self::insert_event_sql(event)?)
            .execute(self.pool())
            .await?;
        let stream_id = seq_id(result.last_insert_rowid());
        self.inner.appended.wake();
        debug!(event_type = %event.event_type, stream_id = %stream_id, "Appended event");
        Ok(stream_id)
    }

    async fn get_event(&self, stream_id: StreamId) -> Result<Option<StoredEvent>> {
        let query = Query::select()
            .columns(EVENT_COLUMNS)
            .from(Events::Table)
            .and_where(Expr::col(Events::StreamId).eq(stream_id.seq() as i64))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(self.pool()).await?;
        row.as_ref().map(stored_from_row).transpose()
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        let query = query_sql(filter);
        let rows = sqlx::query(&query).fetch_all(self.pool()).await?;
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
        self.inner.claim_marks.record(config, self.inner.appended.generation());
        let mut conn = self.pool().acquire().await?;
        Self::begin_immediate(&mut conn).await?;

        let result = async {
            let types = if config.event_types.is_empty() {
                Self::known_types(&mut conn).await?
            } else {
                config.event_types.clone()
            };
            Self::claim_in_tx(&mut conn, config, &types, Utc::now()).await
        }
        .await;

        Self::finish(&mut conn, result).await
    }

    async fn wait_for_events(&self, config: &ConsumerConfig, timeout: Duration) {
        wait_any(&[&self.inner.appended], self.inner.claim_marks.last(config), timeout).await;
    }

    async fn ack(&self, event: &ConsumedEvent) -> Result<()> {
        let query = Query::delete()
            .from_table(PendingEvents::Table)
            .and_where(Expr::col(PendingEvents::StreamId).eq(event.stream_id().seq() as i64))
            .and_where(Expr::col(PendingEvents::ConsumerGroup).eq(event.consumer_group.as_str()))
            .to_string(SqliteQueryBuilder);
        let deleted = sqlx::query(&query).execute(self.pool()).await?.rows_affected();
        if deleted > 0 {
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
        let query = Query::update()
            .table(PendingEvents::Table)
            .value(
                PendingEvents::DeliveryCount,
                Expr::col(PendingEvents::DeliveryCount).add(1),
            )
            .value(PendingEvents::LastError, reason)
            .value(PendingEvents::LastAttempt, format_timestamp(&Utc::now()))
            .and_where(Expr::col(PendingEvents::StreamId).eq(event.stream_id().seq() as i64))
            .and_where(Expr::col(PendingEvents::ConsumerGroup).eq(event.consumer_group.as_str()))
            .to_string(SqliteQueryBuilder);
        let updated = sqlx::query(&query).execute(self.pool()).await?.rows_affected();
        if updated == 0 {
            return Err(claim_not_found(event));
        }
        Ok(())
    }

    async fn extend_timeout(&self, event: &ConsumedEvent, seconds: u64) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        Self::begin_immediate(&mut conn).await?;
        let result = Self::extend_in_tx(&mut conn, event, seconds).await;
        Self::finish(&mut conn, result).await
    }

    async fn get_pending_events(
        &self,
        consumer_group: &str,
        max_idle_ms: u64,
    ) -> Result<Vec<ConsumedEvent>> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(max_idle_ms as i64);
        let query = pending_select()
            .and_where(Expr::col((PendingEvents::Table, PendingEvents::ConsumerGroup)).eq(consumer_group))
            .and_where(Expr::col((PendingEvents::Table, PendingEvents::ClaimedAt)).lte(format_timestamp(&cutoff)))
            .order_by((PendingEvents::Table, PendingEvents::StreamId), Order::Asc)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(self.pool()).await?;
        rows.iter()
            .map(|row| {
                let (_, claim, stored) = claim_from_row(row)?;
                Ok(claim.to_consumed(stored))
            })
            .collect()
    }

    async fn move_to_dlq(&self, event: &ConsumedEvent, reason: &str) -> Result<()> {
        let entry = DlqEntry::from_consumed(String::new(), event, reason);
        let query = Query::insert()
            .into_table(DlqEvents::Table)
            .columns([
                DlqEvents::OriginalStreamId,
                DlqEvents::EventData,
                DlqEvents::FailureReason,
                DlqEvents::FailureTime,
                DlqEvents::DeliveryCount,
                DlqEvents::ConsumerGroup,
                DlqEvents::Replayed,
            ])
            .values_panic([
                (entry.original_stream_id.seq() as i64).into(),
                serde_json::to_string(&entry.event_payload)?.into(),
                entry.failure_reason.into(),
                format_timestamp(&entry.failure_time).into(),
                i64::from(entry.delivery_count).into(),
                entry.consumer_group.into(),
                0.into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(self.pool()).await?;
        Ok(())
    }

    async fn replay_dlq(&self, consumer_group: &str, event_types: Option<&[String]>) -> Result<u64> {
        let mut conn = self.pool().acquire().await?;
        Self::begin_immediate(&mut conn).await?;
        let result = Self::replay_in_tx(&mut conn, consumer_group, event_types).await;
        let replayed = Self::finish(&mut conn, result).await?;
        if replayed > 0 {
            self.inner.appended.wake();
        }
        Ok(replayed)
    }

    async fn get_stream_info(&self) -> Result<StreamInfo> {
        let mut info = StreamInfo {
            backend: self.backend_name().to_string(),
            ..StreamInfo::default()
        };

        let query = Query::select()
            .column(Events::EventType)
            .expr_as(Expr::col(Events::StreamId).count(), Alias::new("n"))
            .from(Events::Table)
            .group_by_col(Events::EventType)
            .to_string(SqliteQueryBuilder);
        for row in sqlx::query(&query).fetch_all(self.pool()).await? {
            let n: i64 = row.try_get("n")?;
            info.events_per_type.insert(row.try_get("event_type")?, n as u64);
        }
        info.total_events = info.events_per_type.values().sum();

        let query = Query::select()
            .expr_as(Expr::col(PendingEvents::Id).count(), Alias::new("n"))
            .from(PendingEvents::Table)
            .to_string(SqliteQueryBuilder);
        let n: i64 = sqlx::query(&query).fetch_one(self.pool()).await?.try_get("n")?;
        info.pending_count = n as u64;

        let query = Query::select()
            .expr_as(Expr::col(DlqEvents::Id).count(), Alias::new("n"))
            .from(DlqEvents::Table)
            .and_where(Expr::col(DlqEvents::Replayed).eq(0))
            .to_string(SqliteQueryBuilder);
        let n: i64 = sqlx::query(&query).fetch_one(self.pool()).await?.try_get("n")?;
        info.dlq_count = n as u64;

        let query = Query::select()
            .distinct()
            .column(ConsumerPositions::GroupName)
            .from(ConsumerPositions::Table)
            .order_by(ConsumerPositions::GroupName, Order::Asc)
            .to_string(SqliteQueryBuilder);
        for row in sqlx::query(&query).fetch_all(self.pool()).await? {
            info.consumer_groups.push(row.try_get("group_name")?);
        }

        Ok(info)
    }

    async fn trim_old_events(&self, max_age_days: u32, event_types: Option<&[String]>) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let (claims, events) = Self::trim_statements(&cutoff, event_types);

        let mut conn = self.pool().acquire().await?;
        Self::begin_immediate(&mut conn).await?;
        let result = Self::trim_in_tx(&mut conn, &claims, &events).await;
        Self::finish(&mut conn, result).await
    }
}
