//! Data types shared by every store backend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Event, Payload};

// ============================================================================
// Stream position
// ============================================================================

/// Backend-assigned position of an event within a type-scoped stream.
///
/// Sequence backends (in-memory, SQLite, PostgreSQL) use `(n, 0)`; Redis
/// Streams use `(milliseconds, sequence)`. Ordering is lexicographic on the
/// two parts, which matches both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct StreamId {
    pub major: u64,
    pub minor: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { major: 0, minor: 0 };

    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    pub const fn from_seq(seq: u64) -> Self {
        Self { major: seq, minor: 0 }
    }

    /// Sequence number for sequence-style backends.
    pub fn seq(&self) -> u64 {
        self.major
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{}", self.major)
        } else {
            write!(f, "{}-{}", self.major, self.minor)
        }
    }
}

impl FromStr for StreamId {
    type Err = super::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || super::StoreError::InvalidStreamId(s.to_string());
        match s.split_once('-') {
            Some((major, minor)) => Ok(Self {
                major: major.parse().map_err(|_| invalid())?,
                minor: minor.parse().map_err(|_| invalid())?,
            }),
            None => Ok(Self::from_seq(s.parse().map_err(|_| invalid())?)),
        }
    }
}

impl From<u64> for StreamId {
    fn from(seq: u64) -> Self {
        Self::from_seq(seq)
    }
}

// ============================================================================
// Stored / consumed events
// ============================================================================

/// An event plus the position the backend assigned on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub stream_id: StreamId,
    pub event: Event,
}

impl StoredEvent {
    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }
}

/// A claimed delivery handed to a durable consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedEvent {
    pub stored: StoredEvent,
    pub consumer_group: String,
    pub consumer_name: String,
    /// Deliveries of this event to the group, including this one.
    pub delivery_count: u32,
    pub claimed_at: DateTime<Utc>,
}

impl ConsumedEvent {
    pub fn stream_id(&self) -> StreamId {
        self.stored.stream_id
    }

    pub fn event(&self) -> &Event {
        &self.stored.event
    }

    pub fn event_type(&self) -> &str {
        &self.stored.event.event_type
    }
}

// ============================================================================
// Query filter
// ============================================================================

/// Predicate for historical queries and catch-up reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    /// Restrict to these types. Empty means all types.
    pub event_types: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Inclusive lower bound.
    pub start_id: Option<StreamId>,
    /// Inclusive upper bound.
    pub end_id: Option<StreamId>,
    pub limit: Option<usize>,
    /// Glob over `source`; `*` matches any run of characters.
    pub source_pattern: Option<String>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_types: types.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_time_range(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn with_id_range(mut self, start: Option<StreamId>, end: Option<StreamId>) -> Self {
        self.start_id = start;
        self.end_id = end;
        self
    }

    pub fn with_source_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.source_pattern = Some(pattern.into());
        self
    }

    /// Reference predicate. Backends that cannot push a condition down
    /// apply it in process with this.
    pub fn matches(&self, stored: &StoredEvent) -> bool {
        let event = &stored.event;
        if !self.event_types.is_empty() && !self.event_types.iter().any(|t| t == &event.event_type) {
            return false;
        }
        if self.start_time.is_some_and(|t| event.timestamp < t) {
            return false;
        }
        if self.end_time.is_some_and(|t| event.timestamp > t) {
            return false;
        }
        if self.start_id.is_some_and(|id| stored.stream_id < id) {
            return false;
        }
        if self.end_id.is_some_and(|id| stored.stream_id > id) {
            return false;
        }
        match &self.source_pattern {
            Some(pattern) => glob_matches(pattern, &event.source),
            None => true,
        }
    }

    /// `source_pattern` rewritten for SQL `LIKE ... ESCAPE '\'`.
    ///
    /// `%`, `_` and `\` in the pattern match themselves.
    pub fn source_like(&self) -> Option<String> {
        self.source_pattern.as_ref().map(|p| {
            let mut out = String::with_capacity(p.len());
            for c in p.chars() {
                match c {
                    '*' => out.push('%'),
                    '%' | '_' | '\\' => {
                        out.push('\\');
                        out.push(c);
                    }
                    _ => out.push(c),
                }
            }
            out
        })
    }

    /// `source_pattern` rewritten for SQLite `GLOB`, which is case-sensitive.
    ///
    /// `?` and `[` are wrapped in a character class so they match themselves.
    pub fn source_glob(&self) -> Option<String> {
        self.source_pattern.as_ref().map(|p| {
            let mut out = String::with_capacity(p.len());
            for c in p.chars() {
                match c {
                    '?' | '[' => {
                        out.push('[');
                        out.push(c);
                        out.push(']');
                    }
                    _ => out.push(c),
                }
            }
            out
        })
    }
}

/// Match `text` against a glob where `*` is the only wildcard.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text;
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == last {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

// ============================================================================
// Consumer configuration
// ============================================================================

/// Identifies a durable subscription.
///
/// `(consumer_group, event_type)` tracks one cursor position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub consumer_group: String,
    pub consumer_name: String,
    pub event_types: Vec<String>,
    pub batch_size: usize,
    pub block_timeout_ms: u64,
    /// Consecutive connection failures tolerated before the loop gives up.
    pub max_retries: u32,
    /// Delay before a nacked event becomes claimable again; also the
    /// minimum backoff after a connection failure.
    pub retry_delay_ms: u64,
    pub dead_letter_after: u32,
    /// Claim lease; an unacknowledged claim is re-claimable after this.
    pub claim_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_group: "default".to_string(),
            consumer_name: "consumer-1".to_string(),
            event_types: Vec::new(),
            batch_size: 10,
            block_timeout_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 1000,
            dead_letter_after: 3,
            claim_timeout_ms: 30_000,
        }
    }
}

impl ConsumerConfig {
    pub fn new<I, S>(group: impl Into<String>, name: impl Into<String>, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            consumer_group: group.into(),
            consumer_name: name.into(),
            event_types: event_types.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block_timeout_ms(mut self, ms: u64) -> Self {
        self.block_timeout_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay_ms = ms;
        self
    }

    pub fn with_dead_letter_after(mut self, deliveries: u32) -> Self {
        self.dead_letter_after = deliveries.max(1);
        self
    }

    pub fn with_claim_timeout_ms(mut self, ms: u64) -> Self {
        self.claim_timeout_ms = ms;
        self
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.claim_timeout_ms).unwrap_or(i64::MAX))
    }
}

// ============================================================================
// Claims and dead letters
// ============================================================================

/// Lease held by one consumer of a group on one event.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingClaim {
    pub stream_id: StreamId,
    pub event_type: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub claimed_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub delivery_count: u32,
    pub last_error: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl PendingClaim {
    /// First claim of an event by a group.
    pub fn new(
        stored: &StoredEvent,
        group: &str,
        consumer: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Self {
        Self {
            stream_id: stored.stream_id,
            event_type: stored.event.event_type.clone(),
            consumer_group: group.to_string(),
            consumer_name: consumer.to_string(),
            claimed_at: now,
            timeout_at: now + lease,
            delivery_count: 1,
            last_error: None,
            last_attempt: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at < now
    }

    /// Re-claimable: the lease ran out, or the holder nacked and the retry
    /// delay has passed.
    pub fn is_claimable(&self, now: DateTime<Utc>, retry_delay: chrono::Duration) -> bool {
        if self.is_expired(now) {
            return true;
        }
        self.nacked_since_claim() && self.last_attempt.is_some_and(|at| at + retry_delay <= now)
    }

    /// Whether a nack was recorded after the latest delivery.
    pub fn nacked_since_claim(&self) -> bool {
        self.last_attempt.is_some_and(|at| at >= self.claimed_at)
    }

    /// Take over an expired claim.
    ///
    /// A nack already counted the upcoming attempt, so the delivery count
    /// only moves when the previous holder went silent.
    pub fn reclaim(&mut self, consumer: &str, now: DateTime<Utc>, lease: chrono::Duration) {
        if !self.nacked_since_claim() {
            self.delivery_count += 1;
        }
        self.consumer_name = consumer.to_string();
        self.claimed_at = now;
        self.timeout_at = now + lease;
    }

    /// Record a failed attempt. The claim is kept.
    pub fn record_nack(&mut self, reason: &str, now: DateTime<Utc>) {
        self.delivery_count += 1;
        self.last_error = Some(reason.to_string());
        self.last_attempt = Some(now);
    }

    /// Push `timeout_at` forward; an already-lapsed lease extends from now.
    pub fn extend(&mut self, seconds: u64, now: DateTime<Utc>) {
        let base = self.timeout_at.max(now);
        self.timeout_at = i64::try_from(seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|d| base.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub fn to_consumed(&self, stored: StoredEvent) -> ConsumedEvent {
        ConsumedEvent {
            stored,
            consumer_group: self.consumer_group.clone(),
            consumer_name: self.consumer_name.clone(),
            delivery_count: self.delivery_count,
            claimed_at: self.claimed_at,
        }
    }
}

/// An event that exhausted its delivery budget.
#[derive(Debug, Clone, PartialEq)]
pub struct DlqEntry {
    pub id: String,
    pub original_stream_id: StreamId,
    pub event_type: String,
    /// Flat [`Event::to_payload`] form.
    pub event_payload: Payload,
    pub failure_reason: String,
    pub failure_time: DateTime<Utc>,
    pub delivery_count: u32,
    pub consumer_group: String,
    pub replayed: bool,
}

impl DlqEntry {
    pub fn from_consumed(id: impl Into<String>, consumed: &ConsumedEvent, reason: &str) -> Self {
        Self {
            id: id.into(),
            original_stream_id: consumed.stream_id(),
            event_type: consumed.event_type().to_string(),
            event_payload: consumed.event().to_payload(),
            failure_reason: reason.to_string(),
            failure_time: Utc::now(),
            delivery_count: consumed.delivery_count,
            consumer_group: consumed.consumer_group.clone(),
            replayed: false,
        }
    }
}

/// Backend introspection snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamInfo {
    pub backend: String,
    pub events_per_type: BTreeMap<String, u64>,
    pub total_events: u64,
    pub pending_count: u64,
    pub dlq_count: u64,
    pub consumer_groups: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stored(id: u64, event_type: &str, source: &str) -> StoredEvent {
        StoredEvent {
            stream_id: StreamId::from_seq(id),
            event: Event::new(event_type, source, Payload::new())
                .with_timestamp(Utc.with_ymd_and_hms(2024, 1, id as u32, 0, 0, 0).unwrap()),
        }
    }

    #[test]
    fn test_stream_id_display_and_parse() {
        assert_eq!(StreamId::from_seq(42).to_string(), "42");
        assert_eq!(StreamId::new(1700000000000, 3).to_string(), "1700000000000-3");
        assert_eq!("42".parse::<StreamId>().unwrap(), StreamId::from_seq(42));
        assert_eq!("5-1".parse::<StreamId>().unwrap(), StreamId::new(5, 1));
        assert!("abc".parse::<StreamId>().is_err());
        assert!("5-x".parse::<StreamId>().is_err());
    }

    #[test]
    fn test_stream_id_ordering() {
        assert!(StreamId::new(5, 0) < StreamId::new(5, 1));
        assert!(StreamId::new(5, 9) < StreamId::new(6, 0));
    }

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("scanner", "scanner"));
        assert!(!glob_matches("scanner", "scanner-2"));
        assert!(glob_matches("scan*", "scanner-2"));
        assert!(glob_matches("*-2", "scanner-2"));
        assert!(glob_matches("s*n*2", "scanner-2"));
        assert!(!glob_matches("s*x*2", "scanner-2"));
        assert!(glob_matches("*", ""));
    }

    #[test]
    fn test_filter_matches() {
        let e = stored(3, "asset.discovered", "scanner-1");

        assert!(EventFilter::new().matches(&e));
        assert!(EventFilter::for_types(["asset.discovered"]).matches(&e));
        assert!(!EventFilter::for_types(["asset.removed"]).matches(&e));
        assert!(EventFilter::new().with_source_pattern("scanner-*").matches(&e));
        assert!(!EventFilter::new().with_source_pattern("tagger*").matches(&e));
        assert!(EventFilter::new()
            .with_id_range(Some(StreamId::from_seq(3)), Some(StreamId::from_seq(3)))
            .matches(&e));
        assert!(!EventFilter::new()
            .with_id_range(Some(StreamId::from_seq(4)), None)
            .matches(&e));

        let jan2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert!(EventFilter::new().with_time_range(Some(jan2), None).matches(&e));
        assert!(!EventFilter::new().with_time_range(None, Some(jan2)).matches(&e));
    }

    #[test]
    fn test_source_like() {
        let filter = EventFilter::new().with_source_pattern("scan*-*");
        assert_eq!(filter.source_like().as_deref(), Some("scan%-%"));

        let literal = EventFilter::new().with_source_pattern(r"scan_er%\*");
        assert_eq!(literal.source_like().as_deref(), Some(r"scan\_er\%\\%"));
    }

    #[test]
    fn test_source_glob_escapes_metacharacters() {
        let filter = EventFilter::new().with_source_pattern("scan?[1]*");
        assert_eq!(filter.source_glob().as_deref(), Some("scan[?][[]1]*"));
        assert_eq!(
            EventFilter::new().with_source_pattern("scan_er*").source_glob().as_deref(),
            Some("scan_er*")
        );
    }

    #[test]
    fn test_source_pattern_is_case_sensitive_and_literal() {
        let upper = stored(1, "asset.discovered", "SCANNER-2");
        let underscore = stored(2, "asset.discovered", "scanXer");
        assert!(!EventFilter::new().with_source_pattern("scanner*").matches(&upper));
        assert!(!EventFilter::new().with_source_pattern("scan_er*").matches(&underscore));
    }

    #[test]
    fn test_claim_delivery_count_rules() {
        let e = stored(1, "asset.discovered", "scanner");
        let t0 = Utc::now();
        let lease = chrono::Duration::seconds(30);
        let mut claim = PendingClaim::new(&e, "g", "c1", t0, lease);
        assert_eq!(claim.delivery_count, 1);

        // Nack counts the next attempt; the re-claim that follows does not.
        let t1 = t0 + chrono::Duration::seconds(1);
        claim.record_nack("boom", t1);
        assert_eq!(claim.delivery_count, 2);
        assert_eq!(claim.last_error.as_deref(), Some("boom"));
        assert!(!claim.is_claimable(t1, chrono::Duration::seconds(5)));
        assert!(claim.is_claimable(t1 + chrono::Duration::seconds(5), chrono::Duration::seconds(5)));
        claim.reclaim("c2", t0 + chrono::Duration::seconds(2), lease);
        assert_eq!(claim.delivery_count, 2);
        assert_eq!(claim.consumer_name, "c2");

        // Silent timeout: the re-claim counts the lost delivery.
        claim.reclaim("c3", t0 + chrono::Duration::seconds(40), lease);
        assert_eq!(claim.delivery_count, 3);
    }

    #[test]
    fn test_claim_extend() {
        let e = stored(1, "asset.discovered", "scanner");
        let t0 = Utc::now();
        let mut claim = PendingClaim::new(&e, "g", "c1", t0, chrono::Duration::seconds(10));

        claim.extend(20, t0);
        assert_eq!(claim.timeout_at, t0 + chrono::Duration::seconds(30));
        assert_eq!(claim.delivery_count, 1);

        // Lapsed lease extends from now.
        let later = t0 + chrono::Duration::seconds(100);
        claim.extend(5, later);
        assert_eq!(claim.timeout_at, later + chrono::Duration::seconds(5));
    }

    #[test]
    fn test_consumer_config_builders_clamp() {
        let config = ConsumerConfig::new("g", "c", ["t"])
            .with_batch_size(0)
            .with_dead_letter_after(0);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.dead_letter_after, 1);
        assert_eq!(config.event_types, vec!["t".to_string()]);
    }
}
