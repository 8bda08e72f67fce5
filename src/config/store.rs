//! Event store configuration types.

use serde::Deserialize;

/// Store type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Memory,
    Sqlite,
    Redis,
    Postgres,
}

/// Store configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store type discriminator.
    #[serde(rename = "type")]
    pub store_type: StoreType,
    pub memory: MemoryStoreConfig,
    pub sqlite: SqliteStoreConfig,
    pub redis: RedisStoreConfig,
    pub postgres: PostgresStoreConfig,
}

/// In-memory ring buffer sizes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// Oldest events of a type are evicted past this count.
    pub max_events_per_type: usize,
    /// Cap on the global (all types) buffer.
    pub max_global_events: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_events_per_type: crate::store::memory::DEFAULT_MAX_EVENTS_PER_TYPE,
            max_global_events: crate::store::memory::DEFAULT_MAX_GLOBAL_EVENTS,
        }
    }
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteStoreConfig {
    /// Database file, created if missing.
    pub path: String,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: "eventline.db".to_string(),
        }
    }
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    pub url: String,
    /// Prepended to every key (`{prefix}{event_type}`).
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "eventline:".to_string(),
        }
    }
}

/// PostgreSQL-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresStoreConfig {
    /// PostgreSQL connection URI.
    pub uri: String,
    pub max_connections: u32,
}

impl Default for PostgresStoreConfig {
    fn default() -> Self {
        Self {
            uri: "postgres://localhost:5432/eventline".to_string(),
            max_connections: 10,
        }
    }
}
