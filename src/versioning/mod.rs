//! Event schema versions and read-path migration.
//!
//! Each event type has a set of declared [`EventVersion`]s and a set of
//! single-step [`EventMigration`]s. [`VersionRegistry::migrate_event`] walks a
//! flat payload forward one step at a time until it reaches the target
//! version. Migrations only run on read; stored events are never rewritten.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{payload_version, EnvelopeError, Event, Payload, DEFAULT_SCHEMA_VERSION};
use crate::store::StoredEvent;

pub mod builtin;

pub use builtin::register_builtin;

/// Error returned by a migration body.
pub type MigrateError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Cannot downgrade {event_type} from v{from} to v{to}")]
    Downgrade { event_type: String, from: u32, to: u32 },

    #[error("No migration path for {event_type} from v{from} to v{to}")]
    NoPath { event_type: String, from: u32, to: u32 },

    #[error("Migration {event_type} v{from}->v{to} rejected the payload")]
    Rejected { event_type: String, from: u32, to: u32 },

    #[error("Migration {event_type} v{from}->v{to} failed: {message}")]
    Failed {
        event_type: String,
        from: u32,
        to: u32,
        message: String,
    },

    #[error("Invalid migration {event_type} v{from}->v{to}: {reason}")]
    InvalidMigration {
        event_type: String,
        from: u32,
        to: u32,
        reason: String,
    },

    #[error("Payload has no event_type")]
    MissingEventType,

    #[error("Migrated payload is not a valid event: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// One declared schema version of an event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventVersion {
    pub version: u32,
    pub description: String,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub deprecated_since: Option<String>,
    #[serde(default)]
    pub removal_version: Option<u32>,
}

impl EventVersion {
    pub fn new(version: u32, description: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            deprecated: false,
            deprecated_since: None,
            removal_version: None,
        }
    }
}

/// A single-step payload transformation `from_version -> to_version`.
pub trait EventMigration: Send + Sync {
    fn event_type(&self) -> &str;

    fn from_version(&self) -> u32;

    fn to_version(&self) -> u32;

    /// Transform the flat payload. The registry stamps `version` afterwards.
    fn migrate(&self, payload: Payload) -> std::result::Result<Payload, MigrateError>;

    /// Whether this payload can be migrated. A `false` aborts the walk.
    fn can_migrate(&self, _payload: &Payload) -> bool {
        true
    }
}

impl<T> EventMigration for Arc<T>
where
    T: EventMigration + ?Sized,
{
    fn event_type(&self) -> &str {
        (**self).event_type()
    }

    fn from_version(&self) -> u32 {
        (**self).from_version()
    }

    fn to_version(&self) -> u32 {
        (**self).to_version()
    }

    fn migrate(&self, payload: Payload) -> std::result::Result<Payload, MigrateError> {
        (**self).migrate(payload)
    }

    fn can_migrate(&self, payload: &Payload) -> bool {
        (**self).can_migrate(payload)
    }
}

type Guard = Box<dyn Fn(&Payload) -> bool + Send + Sync>;

/// [`EventMigration`] built from a closure.
pub struct FnMigration<F> {
    event_type: String,
    from: u32,
    to: u32,
    migrate: F,
    guard: Option<Guard>,
}

impl<F> FnMigration<F>
where
    F: Fn(Payload) -> std::result::Result<Payload, MigrateError> + Send + Sync,
{
    pub fn new(event_type: impl Into<String>, from: u32, to: u32, migrate: F) -> Self {
        Self {
            event_type: event_type.into(),
            from,
            to,
            migrate,
            guard: None,
        }
    }

    /// Only migrate payloads accepted by `guard`.
    pub fn with_guard(mut self, guard: impl Fn(&Payload) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }
}

impl<F> EventMigration for FnMigration<F>
where
    F: Fn(Payload) -> std::result::Result<Payload, MigrateError> + Send + Sync,
{
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn from_version(&self) -> u32 {
        self.from
    }

    fn to_version(&self) -> u32 {
        self.to
    }

    fn migrate(&self, payload: Payload) -> std::result::Result<Payload, MigrateError> {
        (self.migrate)(payload)
    }

    fn can_migrate(&self, payload: &Payload) -> bool {
        self.guard.as_ref().map_or(true, |guard| guard(payload))
    }
}

/// Versions and migrations per event type.
///
/// Registration takes `&mut self` and happens at startup; reads are shared
/// behind an `Arc`.
#[derive(Default)]
pub struct VersionRegistry {
    versions: HashMap<String, BTreeMap<u32, EventVersion>>,
    migrations: HashMap<String, Vec<Arc<dyn EventMigration>>>,
    warned: Mutex<HashSet<(String, u32)>>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the domain event versions and migrations.
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        register_builtin(&mut registry)?;
        Ok(registry)
    }

    pub fn register_version(&mut self, event_type: impl Into<String>, version: EventVersion) {
        self.versions
            .entry(event_type.into())
            .or_default()
            .insert(version.version, version);
    }

    /// Mark a version deprecated, declaring it first if needed.
    pub fn deprecate(
        &mut self,
        event_type: &str,
        version: u32,
        since: impl Into<String>,
        removal_version: Option<u32>,
    ) {
        let entry = self
            .versions
            .entry(event_type.to_string())
            .or_default()
            .entry(version)
            .or_insert_with(|| EventVersion::new(version, ""));
        entry.deprecated = true;
        entry.deprecated_since = Some(since.into());
        entry.removal_version = removal_version;
    }

    /// Add a migration step. Both endpoints become declared versions.
    pub fn register_migration(&mut self, migration: Arc<dyn EventMigration>) -> Result<()> {
        let event_type = migration.event_type().to_string();
        let (from, to) = (migration.from_version(), migration.to_version());
        let invalid = |reason: &str| MigrationError::InvalidMigration {
            event_type: event_type.clone(),
            from,
            to,
            reason: reason.to_string(),
        };

        if to <= from {
            return Err(invalid("to_version must be greater than from_version"));
        }
        let steps = self.migrations.entry(event_type.clone()).or_default();
        if steps.iter().any(|m| m.from_version() == from) {
            return Err(invalid("a migration from this version is already registered"));
        }
        steps.push(migration);
        steps.sort_by_key(|m| m.from_version());

        let versions = self.versions.entry(event_type.clone()).or_default();
        for version in [from, to] {
            versions
                .entry(version)
                .or_insert_with(|| EventVersion::new(version, ""));
        }
        debug!(event_type = %event_type, from, to, "Registered migration");
        Ok(())
    }

    /// Highest declared version, or 1 for unknown types.
    pub fn current_version(&self, event_type: &str) -> u32 {
        self.versions
            .get(event_type)
            .and_then(|versions| versions.keys().next_back().copied())
            .unwrap_or(DEFAULT_SCHEMA_VERSION)
    }

    pub fn versions(&self, event_type: &str) -> Vec<EventVersion> {
        self.versions
            .get(event_type)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.versions.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_deprecated(&self, event_type: &str, version: u32) -> bool {
        self.versions
            .get(event_type)
            .and_then(|versions| versions.get(&version))
            .is_some_and(|v| v.deprecated)
    }

    /// Migrate a flat payload to `target` (default: current version).
    ///
    /// A payload without `version` is treated as version 1.
    pub fn migrate_event(&self, payload: Payload, target: Option<u32>) -> Result<Payload> {
        let event_type = match payload.get("event_type") {
            Some(Value::String(t)) => t.clone(),
            _ => return Err(MigrationError::MissingEventType),
        };
        let mut current = payload
            .get("version")
            .and_then(payload_version)
            .unwrap_or(DEFAULT_SCHEMA_VERSION);
        let target = target.unwrap_or_else(|| self.current_version(&event_type));

        self.warn_if_deprecated(&event_type, current);

        if current == target {
            return Ok(payload);
        }
        if current > target {
            return Err(MigrationError::Downgrade {
                event_type,
                from: current,
                to: target,
            });
        }

        let mut payload = payload;
        while current < target {
            let step = self
                .migrations
                .get(&event_type)
                .and_then(|steps| {
                    steps
                        .iter()
                        .find(|m| m.from_version() == current && m.to_version() <= target)
                })
                .ok_or_else(|| MigrationError::NoPath {
                    event_type: event_type.clone(),
                    from: current,
                    to: target,
                })?;

            let to = step.to_version();
            if !step.can_migrate(&payload) {
                return Err(MigrationError::Rejected {
                    event_type,
                    from: current,
                    to,
                });
            }
            payload = step.migrate(payload).map_err(|e| MigrationError::Failed {
                event_type: event_type.clone(),
                from: current,
                to,
                message: e.to_string(),
            })?;
            payload.insert("version".into(), Value::from(to));
            current = to;
        }

        Ok(payload)
    }

    /// Migrate every payload. A payload that fails keeps its original form.
    pub fn migrate_events(&self, payloads: Vec<Payload>, target: Option<u32>) -> Vec<Payload> {
        payloads
            .into_iter()
            .map(|payload| match self.migrate_event(payload.clone(), target) {
                Ok(migrated) => migrated,
                Err(e) => {
                    let event_type = payload.get("event_type").and_then(Value::as_str).unwrap_or("");
                    warn!(
                        event_type,
                        error = %e,
                        "Migration failed, keeping original payload"
                    );
                    payload
                }
            })
            .collect()
    }

    /// Migrate an event envelope to the current version of its type.
    pub fn migrate_to_current(&self, event: Event) -> Result<Event> {
        let current = self.current_version(&event.event_type);
        if event.schema_version() == current {
            self.warn_if_deprecated(&event.event_type, current);
            return Ok(event);
        }
        let migrated = self.migrate_event(event.to_payload(), Some(current))?;
        Ok(Event::from_payload(migrated)?)
    }

    /// [`Self::migrate_to_current`] for a stored event, keeping its stream id.
    pub fn migrate_stored(&self, stored: &StoredEvent) -> Result<StoredEvent> {
        Ok(StoredEvent {
            stream_id: stored.stream_id,
            event: self.migrate_to_current(stored.event.clone())?,
        })
    }

    fn warn_if_deprecated(&self, event_type: &str, version: u32) {
        let Some(info) = self.versions.get(event_type).and_then(|v| v.get(&version)) else {
            return;
        };
        if !info.deprecated {
            return;
        }
        let first = self
            .warned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((event_type.to_string(), version));
        if first {
            warn!(
                event_type = %event_type,
                version,
                deprecated_since = info.deprecated_since.as_deref().unwrap_or(""),
                removal_version = ?info.removal_version,
                "Reading deprecated event version"
            );
        }
    }
}

#[cfg(test)]
mod tests;
