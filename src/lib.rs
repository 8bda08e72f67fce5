//! Eventline - durable event store and event bus
//!
//! Append-only event streams with consumer groups, at-least-once delivery,
//! dead-letter handling and read-time schema migration, behind one
//! [`store::EventStore`] contract with in-memory, SQLite, Redis Streams and
//! PostgreSQL backends.

pub mod bus;
pub mod config;
pub mod event;
pub mod maintenance;
pub mod store;
pub mod utils;
pub mod versioning;

pub use bus::{EventBus, EventHandler, Middleware};
pub use config::Config;
pub use event::{DomainEvent, Event, Payload};
pub use store::{
    ConsumedEvent, ConsumerConfig, EventFilter, EventStore, InMemoryEventStore, StoreError, StoredEvent, StreamId,
};
pub use versioning::{EventMigration, VersionRegistry};
