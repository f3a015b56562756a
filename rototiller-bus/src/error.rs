//! Error types for the event bus

use rototiller_core::domain::event::DeliveryTag;
use thiserror::Error;

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by an [`EventBus`](crate::EventBus)
///
/// A `Publish` failure means delivery is unknown, not that the event was lost.
#[derive(Debug, Error)]
pub enum BusError {
    /// Event could not be handed to the transport
    #[error("failed to publish '{event_type}': {source}")]
    Publish {
        event_type: String,
        #[source]
        source: sqlx::Error,
    },

    /// Queue or binding declaration failed
    #[error("failed to declare queue '{queue}': {source}")]
    Declare {
        queue: String,
        #[source]
        source: sqlx::Error,
    },

    /// Receiving from a queue failed; fatal for the listener
    #[error("failed to consume from '{queue}': {source}")]
    Consume {
        queue: String,
        #[source]
        source: sqlx::Error,
    },

    /// Ack or nack failed
    #[error("failed to settle delivery {tag}: {source}")]
    Settle {
        tag: DeliveryTag,
        #[source]
        source: sqlx::Error,
    },

    /// Event was not received from the bus, so it cannot be settled
    #[error("event '{0}' carries no delivery tag")]
    MissingDeliveryTag(String),

    #[error("invalid binding pattern '{0}'")]
    InvalidPattern(String),

    #[error("failed to encode event metadata: {0}")]
    Encode(#[from] serde_json::Error),

    /// Transport is not reachable
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}
