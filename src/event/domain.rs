//! Typed domain events.
//!
//! Each event type is a plain struct whose serde derive is its field table.
//! [`DomainEvent`] is the tagged union over every known type; the
//! envelope's `event_type` is the tag.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Event, Payload};

/// Errors converting between [`Event`] envelopes and typed events.
#[derive(Debug, thiserror::Error)]
pub enum DomainEventError {
    #[error("Unknown event type: {0}")]
    UnknownType(String),

    #[error("Failed to decode {event_type}: {source}")]
    Decode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {event_type}: {source}")]
    Encode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Static schema information for a typed event.
pub trait EventSchema: Serialize + DeserializeOwned {
    /// Envelope `event_type` tag.
    const EVENT_TYPE: &'static str;
    /// Schema version this struct encodes.
    const VERSION: u32;

    fn encode(&self) -> Result<Payload, DomainEventError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(DomainEventError::Encode {
                event_type: Self::EVENT_TYPE.to_string(),
                source: serde::ser::Error::custom(format!("expected object, got {}", other)),
            }),
            Err(source) => Err(DomainEventError::Encode {
                event_type: Self::EVENT_TYPE.to_string(),
                source,
            }),
        }
    }

    fn decode(data: &Payload) -> Result<Self, DomainEventError> {
        serde_json::from_value(Value::Object(data.clone())).map_err(|source| DomainEventError::Decode {
            event_type: Self::EVENT_TYPE.to_string(),
            source,
        })
    }
}

// ============================================================================
// Asset catalog events
// ============================================================================

/// A media file was found by a library scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDiscovered {
    pub asset_id: String,
    pub path: String,
    pub size_bytes: u64,
    pub media_type: String,
}

impl EventSchema for AssetDiscovered {
    const EVENT_TYPE: &'static str = "asset.discovered";
    const VERSION: u32 = 2;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetUpdated {
    pub asset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl EventSchema for AssetUpdated {
    const EVENT_TYPE: &'static str = "asset.updated";
    const VERSION: u32 = 1;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRemoved {
    pub asset_id: String,
    #[serde(default)]
    pub reason: String,
}

impl EventSchema for AssetRemoved {
    const EVENT_TYPE: &'static str = "asset.removed";
    const VERSION: u32 = 1;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagsUpdated {
    pub asset_id: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

impl EventSchema for TagsUpdated {
    const EVENT_TYPE: &'static str = "tags.updated";
    const VERSION: u32 = 1;
}

// ============================================================================
// Generation service events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequested {
    pub request_id: String,
    pub provider: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

impl EventSchema for GenerationRequested {
    const EVENT_TYPE: &'static str = "generation.requested";
    const VERSION: u32 = 2;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationCompleted {
    pub request_id: String,
    pub output_path: String,
    #[serde(default)]
    pub duration_ms: u64,
}

impl EventSchema for GenerationCompleted {
    const EVENT_TYPE: &'static str = "generation.completed";
    const VERSION: u32 = 1;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationFailed {
    pub request_id: String,
    pub error: String,
    #[serde(default)]
    pub retryable: bool,
}

impl EventSchema for GenerationFailed {
    const EVENT_TYPE: &'static str = "generation.failed";
    const VERSION: u32 = 1;
}

// ============================================================================
// Union
// ============================================================================

/// Every event type this system publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    AssetDiscovered(AssetDiscovered),
    AssetUpdated(AssetUpdated),
    AssetRemoved(AssetRemoved),
    TagsUpdated(TagsUpdated),
    GenerationRequested(GenerationRequested),
    GenerationCompleted(GenerationCompleted),
    GenerationFailed(GenerationFailed),
}

impl DomainEvent {
    /// All known `event_type` tags with their current schema version.
    pub const KNOWN_TYPES: [(&'static str, u32); 7] = [
        (AssetDiscovered::EVENT_TYPE, AssetDiscovered::VERSION),
        (AssetUpdated::EVENT_TYPE, AssetUpdated::VERSION),
        (AssetRemoved::EVENT_TYPE, AssetRemoved::VERSION),
        (TagsUpdated::EVENT_TYPE, TagsUpdated::VERSION),
        (GenerationRequested::EVENT_TYPE, GenerationRequested::VERSION),
        (GenerationCompleted::EVENT_TYPE, GenerationCompleted::VERSION),
        (GenerationFailed::EVENT_TYPE, GenerationFailed::VERSION),
    ];

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AssetDiscovered(_) => AssetDiscovered::EVENT_TYPE,
            Self::AssetUpdated(_) => AssetUpdated::EVENT_TYPE,
            Self::AssetRemoved(_) => AssetRemoved::EVENT_TYPE,
            Self::TagsUpdated(_) => TagsUpdated::EVENT_TYPE,
            Self::GenerationRequested(_) => GenerationRequested::EVENT_TYPE,
            Self::GenerationCompleted(_) => GenerationCompleted::EVENT_TYPE,
            Self::GenerationFailed(_) => GenerationFailed::EVENT_TYPE,
        }
    }

    pub fn schema_version(&self) -> u32 {
        match self {
            Self::AssetDiscovered(_) => AssetDiscovered::VERSION,
            Self::AssetUpdated(_) => AssetUpdated::VERSION,
            Self::AssetRemoved(_) => AssetRemoved::VERSION,
            Self::TagsUpdated(_) => TagsUpdated::VERSION,
            Self::GenerationRequested(_) => GenerationRequested::VERSION,
            Self::GenerationCompleted(_) => GenerationCompleted::VERSION,
            Self::GenerationFailed(_) => GenerationFailed::VERSION,
        }
    }

    /// Encode into an envelope stamped with the declared schema version.
    pub fn into_event(self, source: impl Into<String>) -> Result<Event, DomainEventError> {
        let data = match &self {
            Self::AssetDiscovered(e) => e.encode()?,
            Self::AssetUpdated(e) => e.encode()?,
            Self::AssetRemoved(e) => e.encode()?,
            Self::TagsUpdated(e) => e.encode()?,
            Self::GenerationRequested(e) => e.encode()?,
            Self::GenerationCompleted(e) => e.encode()?,
            Self::GenerationFailed(e) => e.encode()?,
        };
        Ok(Event::new(self.event_type(), source, data).with_version(self.schema_version()))
    }
}

impl TryFrom<&Event> for DomainEvent {
    type Error = DomainEventError;

    /// Decode by type tag. The event should already be migrated to the
    /// current schema version.
    fn try_from(event: &Event) -> Result<Self, Self::Error> {
        let data = &event.data;
        Ok(match event.event_type.as_str() {
            AssetDiscovered::EVENT_TYPE => Self::AssetDiscovered(AssetDiscovered::decode(data)?),
            AssetUpdated::EVENT_TYPE => Self::AssetUpdated(AssetUpdated::decode(data)?),
            AssetRemoved::EVENT_TYPE => Self::AssetRemoved(AssetRemoved::decode(data)?),
            TagsUpdated::EVENT_TYPE => Self::TagsUpdated(TagsUpdated::decode(data)?),
            GenerationRequested::EVENT_TYPE => {
                Self::GenerationRequested(GenerationRequested::decode(data)?)
            }
            GenerationCompleted::EVENT_TYPE => {
                Self::GenerationCompleted(GenerationCompleted::decode(data)?)
            }
            GenerationFailed::EVENT_TYPE => Self::GenerationFailed(GenerationFailed::decode(data)?),
            other => return Err(DomainEventError::UnknownType(other.to_string())),
        })
    }
}
