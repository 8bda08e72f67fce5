//! Event store implementations.
//!
//! This module contains:
//! - `EventStore` trait: the contract every backend implements
//! - Shared types (`StreamId`, `EventFilter`, `ConsumerConfig`, claims, DLQ entries)
//! - The consumer poll loop shared by all backends
//! - Implementations: in-memory, SQLite, Redis Streams, PostgreSQL

use std::sync::Arc;

use tracing::info;

pub mod consumer;
pub mod event_store;
pub mod memory;
pub mod types;
pub mod wakeup;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use consumer::{ConsumerHandler, HandlerError, HandlerResult, Subscription, SubscriptionSet};
pub use event_store::EventStore;
pub use memory::InMemoryEventStore;
pub use types::{
    ConsumedEvent, ConsumerConfig, DlqEntry, EventFilter, PendingClaim, StoredEvent, StreamId,
    StreamInfo,
};

#[cfg(feature = "postgres")]
pub use postgres::PostgresEventStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStreamStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEventStore;

use crate::config::{StoreConfig, StoreType};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backend unavailable: {0}")]
    Connection(String),

    #[error("Store not connected")]
    NotConnected,

    #[error("Event not found: stream_id={0}")]
    NotFound(StreamId),

    #[error("No claim for stream_id={stream_id} in group {consumer_group}")]
    ClaimNotFound {
        stream_id: StreamId,
        consumer_group: String,
    },

    #[error("Invalid stream id: {0}")]
    InvalidStreamId(String),

    #[error("Invalid stored event: {0}")]
    InvalidEvent(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Operation timed out")]
    Timeout,

    #[error("Consumer task failed: {0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Errors that mean the backend is unreachable rather than the request
    /// being wrong. The consumer loop retries these with backoff.
    pub fn is_connection(&self) -> bool {
        match self {
            StoreError::Connection(_) | StoreError::NotConnected | StoreError::Timeout => true,
            #[cfg(any(feature = "sqlite", feature = "postgres"))]
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
            ),
            #[cfg(feature = "redis")]
            StoreError::Redis(e) => {
                e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
            }
            _ => false,
        }
    }
}

impl From<crate::event::EnvelopeError> for StoreError {
    fn from(e: crate::event::EnvelopeError) -> Self {
        StoreError::InvalidEvent(e.to_string())
    }
}

/// Initialize a store based on configuration.
///
/// The store is returned unconnected; call [`EventStore::connect`] (the bus
/// does this in `initialize`).
pub async fn init_store(config: &StoreConfig) -> Result<Arc<dyn EventStore>> {
    info!(store_type = ?config.store_type, "Initializing event store");

    match config.store_type {
        StoreType::Memory => Ok(Arc::new(InMemoryEventStore::with_capacity(
            config.memory.max_events_per_type,
            config.memory.max_global_events,
        ))),
        StoreType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                Ok(Arc::new(SqliteEventStore::open(&config.sqlite.path).await?))
            }
            #[cfg(not(feature = "sqlite"))]
            {
                tracing::error!("SQLite store requested but 'sqlite' feature is not enabled");
                Err(StoreError::Config("SQLite support requires the 'sqlite' feature".into()))
            }
        }
        StoreType::Redis => {
            #[cfg(feature = "redis")]
            {
                Ok(Arc::new(RedisStreamStore::new(&config.redis.url, &config.redis.key_prefix)?))
            }
            #[cfg(not(feature = "redis"))]
            {
                tracing::error!("Redis store requested but 'redis' feature is not enabled");
                Err(StoreError::Config("Redis support requires the 'redis' feature".into()))
            }
        }
        StoreType::Postgres => {
            #[cfg(feature = "postgres")]
            {
                Ok(Arc::new(PostgresEventStore::new(
                    &config.postgres.uri,
                    config.postgres.max_connections,
                )?))
            }
            #[cfg(not(feature = "postgres"))]
            {
                tracing::error!("PostgreSQL store requested but 'postgres' feature is not enabled");
                Err(StoreError::Config("PostgreSQL support requires the 'postgres' feature".into()))
            }
        }
    }
}
