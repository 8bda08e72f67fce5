//! Event envelope.
//!
//! [`Event`] is the canonical, backend-agnostic representation of a domain
//! event. Every backend stores the envelope columns (`event_id`,
//! `event_type`, `timestamp`, `source`, `version`) separately and keeps the
//! domain fields in a flat [`Payload`] map.
//!
//! Typed domain events live in [`domain`]; they encode to and decode from
//! the envelope through an explicit type-tag switch.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod domain;

pub use domain::{DomainEvent, DomainEventError, EventSchema};

/// Flat key/value wire form of an event.
pub type Payload = serde_json::Map<String, Value>;

/// Schema version assumed when an event or payload carries none.
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// Envelope keys written by [`Event::to_payload`].
pub const ENVELOPE_KEYS: [&str; 5] = ["event_id", "event_type", "timestamp", "source", "version"];

/// Errors reconstructing an event from its flat payload.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Missing envelope field: {0}")]
    MissingField(&'static str),

    #[error("Invalid envelope field {field}: {message}")]
    InvalidField { field: &'static str, message: String },
}

/// A domain event.
///
/// `event_id` and `timestamp` are assigned at construction and never
/// recomputed. `version` is `None` until the bus (or the producer) stamps
/// the schema version of the event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub version: Option<u32>,
    pub data: Payload,
}

impl Event {
    /// Create a new event with a time-ordered id and the current timestamp.
    ///
    /// The timestamp is truncated to microseconds so it survives every
    /// backend's storage format unchanged.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: Payload) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now().trunc_subsecs(6),
            source: source.into(),
            version: None,
            data,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Override the timestamp. Truncated to microseconds, the precision every backend stores.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(6);
        self
    }

    /// Schema version, falling back to [`DEFAULT_SCHEMA_VERSION`].
    pub fn schema_version(&self) -> u32 {
        self.version.unwrap_or(DEFAULT_SCHEMA_VERSION)
    }

    /// Serialize the data map to JSON text for storage.
    pub fn data_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.data)
    }

    /// Flatten the envelope and data into one map.
    ///
    /// Envelope keys win over data fields of the same name.
    pub fn to_payload(&self) -> Payload {
        let mut payload = self.data.clone();
        payload.insert("event_id".into(), Value::String(self.event_id.clone()));
        payload.insert("event_type".into(), Value::String(self.event_type.clone()));
        payload.insert(
            "timestamp".into(),
            Value::String(format_timestamp(&self.timestamp)),
        );
        payload.insert("source".into(), Value::String(self.source.clone()));
        payload.insert("version".into(), Value::from(self.schema_version()));
        payload
    }

    /// Rebuild an event from a flat payload produced by [`Event::to_payload`].
    pub fn from_payload(mut payload: Payload) -> Result<Self, EnvelopeError> {
        let event_id = take_string(&mut payload, "event_id")?;
        let event_type = take_string(&mut payload, "event_type")?;
        let timestamp_raw = take_string(&mut payload, "timestamp")?;
        let timestamp = parse_timestamp(&timestamp_raw).map_err(|e| EnvelopeError::InvalidField {
            field: "timestamp",
            message: e.to_string(),
        })?;
        let source = match payload.remove("source") {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let version = match payload.remove("version") {
            None | Some(Value::Null) => None,
            Some(v) => Some(payload_version(&v).ok_or_else(|| EnvelopeError::InvalidField {
                field: "version",
                message: format!("expected unsigned integer, got {}", v),
            })?),
        };

        Ok(Self {
            event_id,
            event_type,
            timestamp,
            source,
            version,
            data: payload,
        })
    }
}

fn take_string(payload: &mut Payload, field: &'static str) -> Result<String, EnvelopeError> {
    match payload.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(EnvelopeError::InvalidField {
            field,
            message: format!("expected string, got {}", other),
        }),
        None => Err(EnvelopeError::MissingField(field)),
    }
}

/// Read a version number from a payload value.
///
/// Accepts integers and integral strings (`"2"`), which older producers emit.
pub fn payload_version(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Fixed-width RFC3339 timestamp (microsecond precision, `Z` suffix).
///
/// Fixed width keeps lexicographic order equal to chronological order,
/// which the SQL backends rely on for TEXT timestamp columns.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests;
