//! Rototiller Event Bus
//!
//! Durable, topic-routed, at-least-once delivery of job lifecycle events.
//!
//! Producers `emit` events whose type is the routing key. Consumers declare a
//! durable queue bound to one or more patterns, `listen` on it, and settle each
//! delivery with `ack` or `nack`. Anything left unsettled is redelivered, so
//! consumers must be idempotent.
//!
//! Two transports implement [`EventBus`]:
//! - [`PgEventBus`]: Postgres tables, shared with the catalog
//! - [`InMemoryEventBus`]: process-local, for tests

pub mod config;
pub mod error;
mod memory;
mod postgres;
pub mod routing;

pub use config::BusConfig;
pub use error::{BusError, Result};
pub use memory::InMemoryEventBus;
pub use postgres::PgEventBus;

use async_trait::async_trait;
use rototiller_core::domain::event::Event;
use tokio::sync::mpsc;

/// Handle to a declared consumer queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    pub id: String,
    pub queue: String,
    pub patterns: Vec<String>,
}

/// Live delivery from one consumer queue
///
/// Dropping the subscription stops delivery; deliveries not yet settled
/// are redelivered later.
pub struct Subscription {
    pub events: mpsc::Receiver<Event>,
    /// Transport failures; the first one ends the subscription
    pub errors: mpsc::Receiver<BusError>,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an event, routed by its type
    async fn emit(&self, event: &Event) -> Result<()>;

    /// Declares (idempotently) a durable queue bound to the given patterns
    async fn new_consumer(&self, consumer_id: &str, patterns: &[&str]) -> Result<Consumer>;

    /// Starts asynchronous delivery from the consumer's queue
    fn listen(&self, consumer: &Consumer) -> Subscription;

    /// Acknowledges a received event
    async fn ack(&self, event: &Event) -> Result<()>;

    /// Negatively acknowledges a received event, redelivering it if `requeue`
    async fn nack(&self, event: &Event, requeue: bool) -> Result<()>;
}

pub(crate) fn delivery_tag(event: &Event) -> Result<u64> {
    event
        .delivery_tag
        .ok_or_else(|| BusError::MissingDeliveryTag(event.event_type.clone()))
}
