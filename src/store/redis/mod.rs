//! Redis Streams event store.
//!
//! One stream per event type under `{prefix}{event_type}`, with native
//! consumer groups. Claims are the group's pending entries list: new entries
//! come from `XREADGROUP >`, expired ones are taken over with `XCLAIM`, whose
//! min-idle check makes the takeover atomic. Dead letters go to
//! `{prefix}dlq:{event_type}`.
//!
//! Entry ids are assigned by a script from one clock shared by every stream
//! of the prefix, so a stream id names exactly one event across all types.
//!
//! Blocking reads run on dedicated connections so they never stall the
//! shared multiplexed connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimOptions, StreamClaimReply, StreamId as Entry, StreamInfoGroupsReply,
    StreamPendingCountReply, StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, Script};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::consumer::{ConsumerHandler, Subscription, SubscriptionSet};
use super::types::{
    ConsumedEvent, ConsumerConfig, DlqEntry, EventFilter, StoredEvent, StreamId, StreamInfo,
};
use super::{EventStore, Result, StoreError};
use crate::event::{format_timestamp, parse_timestamp, Event, Payload};

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "eventline:";

/// Upper bound on pending entries inspected per stream and cycle.
const PENDING_SCAN: usize = 100;

/// XADD with an explicit id from the shared clock hash `KEYS[2]`.
///
/// KEYS: stream, clock, type set. ARGV: event type, then field/value pairs.
const APPEND_SCRIPT: &str = r"
local t = redis.call('TIME')
local ms = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local last = tonumber(redis.call('HGET', KEYS[2], 'ms') or '0')
local seq = 0
if ms <= last then
  ms = last
  seq = redis.call('HINCRBY', KEYS[2], 'seq', 1)
else
  redis.call('HSET', KEYS[2], 'ms', ms, 'seq', 0)
end
local id = string.format('%d-%d', ms, seq)
redis.call('XADD', KEYS[1], id, unpack(ARGV, 2))
redis.call('SADD', KEYS[3], ARGV[1])
return id
";

struct Inner {
    client: Client,
    key_prefix: String,
    conn: RwLock<Option<ConnectionManager>>,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    groups_created: Mutex<HashSet<(String, String)>>,
    /// Entries a blocking read delivered beyond the batch, keyed by (group, consumer).
    overflow: Mutex<HashMap<(String, String), Vec<ConsumedEvent>>>,
    append_script: Script,
    subscriptions: SubscriptionSet,
}

/// Redis Streams implementation of EventStore. Cloning shares connections.
#[derive(Clone)]
pub struct RedisStreamStore {
    inner: Arc<Inner>,
}

impl RedisStreamStore {
    /// Create an unconnected store. `connect` opens the connection.
    pub fn new(url: &str, key_prefix: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                key_prefix: key_prefix.to_string(),
                conn: RwLock::new(None),
                blocking: Mutex::new(Vec::new()),
                groups_created: Mutex::new(HashSet::new()),
                overflow: Mutex::new(HashMap::new()),
                append_script: Script::new(APPEND_SCRIPT),
                subscriptions: SubscriptionSet::new(),
            }),
        })
    }

    fn stream_key(&self, event_type: &str) -> String {
        format!("{}{}", self.inner.key_prefix, event_type)
    }

    fn dlq_key(&self, event_type: &str) -> String {
        format!("{}dlq:{}", self.inner.key_prefix, event_type)
    }

    fn types_key(&self) -> String {
        format!("{}event_types", self.inner.key_prefix)
    }

    fn clock_key(&self) -> String {
        format!("{}id_clock", self.inner.key_prefix)
    }

    fn nack_key(&self, group: &str) -> String {
        format!("{}nack:{}", self.inner.key_prefix, group)
    }

    fn lease_key(&self, group: &str) -> String {
        format!("{}lease:{}", self.inner.key_prefix, group)
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        self.inner.conn.read().await.clone().ok_or(StoreError::NotConnected)
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.inner.blocking.lock().await.pop() {
            return Ok(conn);
        }
        Ok(self.inner.client.get_multiplexed_async_connection().await?)
    }

    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        self.inner.blocking.lock().await.push(conn);
    }

    async fn event_types(&self, conn: &mut ConnectionManager) -> Result<Vec<String>> {
        let mut types: Vec<String> = conn.smembers(self.types_key()).await?;
        types.sort();
        Ok(types)
    }

    async fn ensure_group(&self, conn: &mut ConnectionManager, key: &str, group: &str) -> Result<()> {
        let marker = (key.to_string(), group.to_string());
        if self.inner.groups_created.lock().await.contains(&marker) {
            return Ok(());
        }
        match conn.xgroup_create_mkstream::<_, _, _, ()>(key, group, "0").await {
            Ok(()) => debug!(key, group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }
        self.inner.groups_created.lock().await.insert(marker);
        Ok(())
    }

    async fn read_entry(conn: &mut ConnectionManager, key: &str, id: &str) -> Result<Option<StoredEvent>> {
        let reply: StreamRangeReply = conn.xrange_count(key, id, id, 1).await?;
        reply.ids.first().map(stored_from_entry).transpose()
    }

    async fn xadd_event(&self, conn: &mut ConnectionManager, event: &Event) -> Result<StreamId> {
        let fields = [
            ("event_id", event.event_id.clone()),
            ("event_type", event.event_type.clone()),
            ("event_data", event.data_json()?),
            ("timestamp", format_timestamp(&event.timestamp)),
            ("source", event.source.clone()),
            ("version", event.schema_version().to_string()),
        ];
        let mut invocation = self.inner.append_script.key(self.stream_key(&event.event_type));
        invocation.key(self.clock_key()).key(self.types_key()).arg(&event.event_type);
        for (name, value) in &fields {
            invocation.arg(*name).arg(value);
        }
        let id: String = invocation.invoke_async(conn).await?;
        id.parse()
    }

    /// Entries held back from an earlier claim by this consumer, up to `budget`.
    async fn take_overflow(&self, config: &ConsumerConfig, budget: usize) -> Vec<ConsumedEvent> {
        let mut overflow = self.inner.overflow.lock().await;
        let marker = (config.consumer_group.clone(), config.consumer_name.clone());
        let Some(held) = overflow.get_mut(&marker) else {
            return Vec::new();
        };
        let take = held.len().min(budget);
        let taken: Vec<ConsumedEvent> = held.drain(..take).collect();
        if held.is_empty() {
            overflow.remove(&marker);
        }
        taken
    }

    async fn hold_overflow(&self, config: &ConsumerConfig, extra: Vec<ConsumedEvent>) {
        if extra.is_empty() {
            return;
        }
        let marker = (config.consumer_group.clone(), config.consumer_name.clone());
        self.inner.overflow.lock().await.entry(marker).or_default().extend(extra);
    }

    /// Take over expired or retry-due pending entries of one stream.
    async fn reclaim_stream(
        &self,
        conn: &mut ConnectionManager,
        config: &ConsumerConfig,
        event_type: &str,
        budget: usize,
    ) -> Result<Vec<ConsumedEvent>> {
        let key = self.stream_key(event_type);
        let group = config.consumer_group.as_str();
        let pending: StreamPendingCountReply = conn
            .xpending_count(&key, group, "-", "+", PENDING_SCAN)
            .await?;
        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let now_ms = Utc::now().timestamp_millis();
        let claim_timeout = config.claim_timeout_ms as usize;
        let retry_delay = config.retry_delay_ms as usize;
        let fields: Vec<String> = pending.ids.iter().map(|p| field(event_type, &p.id)).collect();
        let nacks: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.nack_key(group))
            .arg(&fields)
            .query_async(conn)
            .await?;
        let leases: Vec<Option<i64>> = redis::cmd("HMGET")
            .arg(self.lease_key(group))
            .arg(&fields)
            .query_async(conn)
            .await?;

        let mut claimed = Vec::new();
        for ((entry, nack), lease) in pending.ids.iter().zip(nacks).zip(leases) {
            if claimed.len() >= budget {
                break;
            }
            let nacked_at = nack.as_deref().and_then(nack_time_ms);
            let min_idle = match nacked_at {
                Some(at) if now_ms - at >= config.retry_delay_ms as i64 => retry_delay.max(1),
                _ if entry.last_delivered_ms >= claim_timeout
                    && lease.map_or(true, |until| until <= now_ms) =>
                {
                    claim_timeout
                }
                _ => continue,
            };

            // XCLAIM re-checks idle time, so only one consumer wins.
            let reply: StreamClaimReply = conn
                .xclaim(&key, group, &config.consumer_name, min_idle, &[&entry.id])
                .await?;
            let Some(won) = reply.ids.first() else {
                continue;
            };
            let _: () = redis::pipe()
                .hdel(self.nack_key(group), field(event_type, &entry.id))
                .hdel(self.lease_key(group), field(event_type, &entry.id))
                .query_async(conn)
                .await?;

            claimed.push(ConsumedEvent {
                stored: stored_from_entry(won)?,
                consumer_group: group.to_string(),
                consumer_name: config.consumer_name.clone(),
                delivery_count: u32::try_from(entry.times_delivered + 1).unwrap_or(u32::MAX),
                claimed_at: Utc::now(),
            });
        }
        Ok(claimed)
    }

    /// `XREADGROUP >` across `keys`, blocking when `block` is set.
    async fn read_new(
        &self,
        config: &ConsumerConfig,
        keys: &[String],
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<ConsumedEvent>> {
        let ids = vec![">"; keys.len()];
        let mut options = StreamReadOptions::default()
            .group(&config.consumer_group, &config.consumer_name)
            .count(count.max(1));
        if let Some(block) = block {
            options = options.block(block.as_millis().max(1) as usize);
        }

        let reply: Option<StreamReadReply> = match block {
            Some(_) => {
                let mut conn = self.checkout_blocking().await?;
                let reply = conn.xread_options(keys, &ids, &options).await;
                if reply.is_ok() {
                    self.checkin_blocking(conn).await;
                }
                reply?
            }
            None => self.conn().await?.xread_options(keys, &ids, &options).await?,
        };

        let now = Utc::now();
        let mut claimed = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in &stream.ids {
                claimed.push(ConsumedEvent {
                    stored: stored_from_entry(entry)?,
                    consumer_group: config.consumer_group.clone(),
                    consumer_name: config.consumer_name.clone(),
                    delivery_count: 1,
                    claimed_at: now,
                });
            }
        }
        Ok(claimed)
    }

    /// Whether the group's last-delivered id is at or past `stream_id`.
    async fn delivered_past(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        group: &str,
        stream_id: StreamId,
    ) -> Result<bool> {
        let info: StreamInfoGroupsReply = match conn.xinfo_groups(key).await {
            Ok(info) => info,
            Err(_) => return Ok(false),
        };
        Ok(info
            .groups
            .iter()
            .find(|g| g.name == group)
            .and_then(|g| g.last_delivered_id.parse::<StreamId>().ok())
            .is_some_and(|last| stream_id <= last))
    }

    async fn is_pending(&self, conn: &mut ConnectionManager, event: &ConsumedEvent) -> Result<bool> {
        let id = redis_id(event.stream_id());
        let reply: StreamPendingCountReply = match conn
            .xpending_count(self.stream_key(event.event_type()), &event.consumer_group, &id, &id, 1)
            .await
        {
            Ok(reply) => reply,
            Err(e) if e.code() == Some("NOGROUP") => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(!reply.ids.is_empty())
    }
}

/// First `budget` events, and the rest.
fn split_batch(mut events: Vec<ConsumedEvent>, budget: usize) -> (Vec<ConsumedEvent>, Vec<ConsumedEvent>) {
    let extra = if events.len() > budget { events.split_off(budget) } else { Vec::new() };
    (events, extra)
}

/// Redis entry id for `stream_id` (always `ms-seq`).
fn redis_id(stream_id: StreamId) -> String {
    format!("{}-{}", stream_id.major, stream_id.minor)
}

fn field(event_type: &str, id: &str) -> String {
    format!("{}|{}", event_type, id)
}

fn nack_time_ms(raw: &str) -> Option<i64> {
    serde_json::from_str::<Value>(raw).ok()?.get("at_ms")?.as_i64()
}

fn entry_field(entry: &Entry, name: &str) -> Result<String> {
    entry
        .get::<String>(name)
        .ok_or_else(|| StoreError::InvalidEvent(format!("stream entry {} has no {}", entry.id, name)))
}

fn payload_from_json(raw: &str) -> Result<Payload> {
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::InvalidEvent("event_data is not a JSON object".into())),
    }
}

fn stored_from_entry(entry: &Entry) -> Result<StoredEvent> {
    let timestamp = entry_field(entry, "timestamp")?;
    let version = entry_field(entry, "version")?;
    Ok(StoredEvent {
        stream_id: entry.id.parse()?,
        event: Event {
            event_id: entry_field(entry, "event_id")?,
            event_type: entry_field(entry, "event_type")?,
            timestamp: parse_timestamp(&timestamp)
                .map_err(|e| StoreError::InvalidEvent(format!("bad timestamp {:?}: {}", timestamp, e)))?,
            source: entry_field(entry, "source").unwrap_or_default(),
            version: version.parse().ok(),
            data: payload_from_json(&entry_field(entry, "event_data")?)?,
        },
    })
}

#[async_trait]
impl EventStore for RedisStreamStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.inner.conn.write().await;
        if slot.is_some() {
            return Ok(());
        }
        let conn = ConnectionManager::new(self.inner.client.clone()).await?;
        *slot = Some(conn);
        info!(prefix = %self.inner.key_prefix, "Connected to Redis");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.subscriptions.shutdown().await;
        self.inner.blocking.lock().await.clear();
        self.inner.groups_created.lock().await.clear();
        self.inner.overflow.lock().await.clear();
        self.inner.conn.write().await.take();
        Ok(())
    }

    async fn append(&self, event: &Event) -> Result<StreamId> {
        let mut conn = self.conn().await?;
        let stream_id = self.xadd_event(&mut conn, event).await?;
        debug!(event_type = %event.event_type, stream_id = %stream_id, "Appended event");
        Ok(stream_id)
    }

    async fn get_event(&self, stream_id: StreamId) -> Result<Option<StoredEvent>> {
        let mut conn = self.conn().await?;
        let id = redis_id(stream_id);
        for event_type in self.event_types(&mut conn).await? {
            if let Some(stored) = Self::read_entry(&mut conn, &self.stream_key(&event_type), &id).await? {
                return Ok(Some(stored));
            }
        }
        Ok(None)
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        let mut conn = self.conn().await?;
        let types = if filter.event_types.is_empty() {
            self.event_types(&mut conn).await?
        } else {
            filter.event_types.clone()
        };
        let start = filter.start_id.map(redis_id).unwrap_or_else(|| "-".to_string());
        let end = filter.end_id.map(redis_id).unwrap_or_else(|| "+".to_string());

        let mut found = Vec::new();
        for event_type in &types {
            let reply: StreamRangeReply = conn.xrange(self.stream_key(event_type), &start, &end).await?;
            for entry in &reply.ids {
                let stored = stored_from_entry(entry)?;
                if filter.matches(&stored) {
                    found.push(stored);
                }
            }
        }
        found.sort_by_key(|e| e.stream_id);
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn subscribe(
        &self,
        config: ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription> {
        self.conn().await?;
        Ok(self.inner.subscriptions.spawn(self.clone(), config, handler))
    }

    async fn claim(&self, config: &ConsumerConfig) -> Result<Vec<ConsumedEvent>> {
        let mut conn = self.conn().await?;
        let types = if config.event_types.is_empty() {
            self.event_types(&mut conn).await?
        } else {
            config.event_types.clone()
        };
        if types.is_empty() {
            tokio::time::sleep(config.block_timeout()).await;
            return Ok(Vec::new());
        }

        let keys: Vec<String> = types.iter().map(|t| self.stream_key(t)).collect();
        for key in &keys {
            self.ensure_group(&mut conn, key, &config.consumer_group).await?;
        }

        let budget = config.batch_size.max(1);
        let mut claimed = self.take_overflow(config, budget).await;
        for event_type in &types {
            if claimed.len() >= budget {
                break;
            }
            let taken = self
                .reclaim_stream(&mut conn, config, event_type, budget - claimed.len())
                .await?;
            claimed.extend(taken);
        }

        // COUNT applies per stream, so streams are read one at a time.
        for key in &keys {
            if claimed.len() >= budget {
                break;
            }
            let remaining = budget - claimed.len();
            claimed.extend(self.read_new(config, std::slice::from_ref(key), remaining, None).await?);
        }
        if claimed.is_empty() {
            let woken = self
                .read_new(config, &keys, budget, Some(config.block_timeout()))
                .await?;
            let (batch, extra) = split_batch(woken, budget);
            self.hold_overflow(config, extra).await;
            claimed = batch;
        }
        Ok(claimed)
    }

    async fn wait_for_events(&self, _config: &ConsumerConfig, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    fn claim_blocks(&self) -> bool {
        true
    }

    async fn ack(&self, event: &ConsumedEvent) -> Result<()> {
        let mut conn = self.conn().await?;
        let key = self.stream_key(event.event_type());
        let id = redis_id(event.stream_id());
        let group = event.consumer_group.as_str();

        let acked: i64 = match conn.xack(&key, group, &[&id]).await {
            Ok(n) => n,
            Err(e) if e.code() == Some("NOGROUP") => 0,
            Err(e) => return Err(e.into()),
        };
        let _: () = redis::pipe()
            .hdel(self.nack_key(group), field(event.event_type(), &id))
            .hdel(self.lease_key(group), field(event.event_type(), &id))
            .query_async(&mut conn)
            .await?;

        if acked > 0 || self.delivered_past(&mut conn, &key, group, event.stream_id()).await? {
            Ok(())
        } else {
            Err(StoreError::ClaimNotFound {
                stream_id: event.stream_id(),
                consumer_group: group.to_string(),
            })
        }
    }

    async fn nack(&self, event: &ConsumedEvent, reason: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        if !self.is_pending(&mut conn, event).await? {
            return Err(StoreError::ClaimNotFound {
                stream_id: event.stream_id(),
                consumer_group: event.consumer_group.clone(),
            });
        }
        let record = json!({ "error": reason, "at_ms": Utc::now().timestamp_millis() });
        let _: () = conn
            .hset(
                self.nack_key(&event.consumer_group),
                field(event.event_type(), &redis_id(event.stream_id())),
                record.to_string(),
            )
            .await?;
        Ok(())
    }

    async fn extend_timeout(&self, event: &ConsumedEvent, seconds: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let id = redis_id(event.stream_id());
        let options = StreamClaimOptions::default().with_justid();
        let ids: Vec<String> = conn
            .xclaim_options(
                self.stream_key(event.event_type()),
                &event.consumer_group,
                &event.consumer_name,
                0,
                &[&id],
                options,
            )
            .await?;
        if ids.is_empty() {
            return Err(StoreError::ClaimNotFound {
                stream_id: event.stream_id(),
                consumer_group: event.consumer_group.clone(),
            });
        }
        let extension_ms = i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        let until = Utc::now().timestamp_millis().saturating_add(extension_ms);
        let _: () = conn
            .hset(self.lease_key(&event.consumer_group), field(event.event_type(), &id), until)
            .await?;
        Ok(())
    }

    async fn get_pending_events(
        &self,
        consumer_group: &str,
        max_idle_ms: u64,
    ) -> Result<Vec<ConsumedEvent>> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let mut pending_events = Vec::new();

        for event_type in self.event_types(&mut conn).await? {
            let key = self.stream_key(&event_type);
            let reply: StreamPendingCountReply = match redis::cmd("XPENDING")
                .arg(&key)
                .arg(consumer_group)
                .arg("IDLE")
                .arg(max_idle_ms)
                .arg("-")
                .arg("+")
                .arg(PENDING_SCAN)
                .query_async(&mut conn)
                .await
            {
                Ok(reply) => reply,
                Err(e) if e.code() == Some("NOGROUP") => continue,
                Err(e) => return Err(e.into()),
            };

            for entry in reply.ids {
                let Some(stored) = Self::read_entry(&mut conn, &key, &entry.id).await? else {
                    continue;
                };
                pending_events.push(ConsumedEvent {
                    stored,
                    consumer_group: consumer_group.to_string(),
                    consumer_name: entry.consumer,
                    delivery_count: u32::try_from(entry.times_delivered).unwrap_or(u32::MAX),
                    claimed_at: now - chrono::Duration::milliseconds(entry.last_delivered_ms as i64),
                });
            }
        }
        pending_events.sort_by_key(|e| e.stream_id());
        Ok(pending_events)
    }

    async fn move_to_dlq(&self, event: &ConsumedEvent, reason: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let entry = DlqEntry::from_consumed(String::new(), event, reason);
        let fields = [
            ("original_stream_id", redis_id(entry.original_stream_id)),
            ("event_type", entry.event_type.clone()),
            ("event_data", serde_json::to_string(&entry.event_payload)?),
            ("failure_reason", entry.failure_reason.clone()),
            ("failure_time", format_timestamp(&entry.failure_time)),
            ("delivery_count", entry.delivery_count.to_string()),
            ("consumer_group", entry.consumer_group.clone()),
        ];
        let _: String = conn.xadd(self.dlq_key(&entry.event_type), "*", &fields).await?;
        Ok(())
    }

    async fn replay_dlq(&self, consumer_group: &str, event_types: Option<&[String]>) -> Result<u64> {
        let mut conn = self.conn().await?;
        let types = match event_types {
            Some(types) => types.to_vec(),
            None => self.event_types(&mut conn).await?,
        };

        let mut replayed = 0;
        for event_type in &types {
            let dlq_key = self.dlq_key(event_type);
            let reply: StreamRangeReply = conn.xrange(&dlq_key, "-", "+").await?;
            for entry in &reply.ids {
                if entry.get::<String>("consumer_group").as_deref() != Some(consumer_group) {
                    continue;
                }
                let event = Event::from_payload(payload_from_json(&entry_field(entry, "event_data")?)?)?;
                let stream_id = self.xadd_event(&mut conn, &event).await?;
                let _: i64 = conn.xdel(&dlq_key, &[&entry.id]).await?;
                debug!(dlq_id = %entry.id, stream_id = %stream_id, "Replayed dead letter");
                replayed += 1;
            }
        }
        Ok(replayed)
    }

    async fn get_stream_info(&self) -> Result<StreamInfo> {
        let mut conn = self.conn().await?;
        let mut info = StreamInfo {
            backend: self.backend_name().to_string(),
            ..StreamInfo::default()
        };
        let mut groups = HashSet::new();

        for event_type in self.event_types(&mut conn).await? {
            let key = self.stream_key(&event_type);
            let len: u64 = conn.xlen(&key).await?;
            info.events_per_type.insert(event_type.clone(), len);
            info.dlq_count += conn.xlen::<_, u64>(self.dlq_key(&event_type)).await?;

            if let Ok(reply) = conn.xinfo_groups::<_, StreamInfoGroupsReply>(&key).await {
                for group in reply.groups {
                    info.pending_count += group.pending as u64;
                    groups.insert(group.name);
                }
            }
        }
        info.total_events = info.events_per_type.values().sum();
        info.consumer_groups = groups.into_iter().collect();
        info.consumer_groups.sort();
        Ok(info)
    }

    async fn trim_old_events(&self, max_age_days: u32, event_types: Option<&[String]>) -> Result<u64> {
        let mut conn = self.conn().await?;
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let min_id = format!("{}-0", cutoff.timestamp_millis().max(0));
        let types = match event_types {
            Some(types) => types.to_vec(),
            None => self.event_types(&mut conn).await?,
        };

        let mut removed = 0;
        for event_type in &types {
            let n: u64 = redis::cmd("XTRIM")
                .arg(self.stream_key(event_type))
                .arg("MINID")
                .arg(&min_id)
                .query_async(&mut conn)
                .await?;
            removed += n;
        }
        if removed > 0 {
            info!(removed, cutoff = %format_timestamp(&cutoff), "Trimmed Redis streams");
        }
        Ok(removed)
    }
}
