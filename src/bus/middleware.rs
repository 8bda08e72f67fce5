//! Publish-time middleware.
//!
//! Middleware runs in registration order before the event is persisted.
//! Returning `None` drops the event: it is neither stored nor delivered.

use async_trait::async_trait;
use tracing::debug;

use crate::event::Event;

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &'static str {
        "middleware"
    }

    /// Transform the event, or drop it by returning `None`.
    async fn before_publish(&self, event: Event) -> Option<Event>;
}

/// Logs every published event at debug level and passes it through.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn before_publish(&self, event: Event) -> Option<Event> {
        debug!(
            event_type = %event.event_type,
            event_id = %event.event_id,
            source = %event.source,
            version = ?event.version,
            "Publishing event"
        );
        Some(event)
    }
}
