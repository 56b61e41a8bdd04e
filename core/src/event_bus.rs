//! Event source abstraction for at-least-once ingestion.
//!
//! The ingestion consumer reads [`Delivery`] values from an [`EventSource`].
//! Each delivery carries the raw payload and an acknowledgement handle; the
//! consumer acknowledges only after the event has been applied or durably
//! dead-lettered.
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: Deliveries may arrive more than once
//! - **Acknowledge after processing**: A delivery that is dropped without
//!   [`Delivery::ack`] is redelivered by the broker
//! - **Ordered within partition**: Producers key messages by position, so
//!   events for one position arrive in order
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in the testing crate, with ack tracking
//! - `RedpandaEventSource` in the redpanda crate, with manual offset commits
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//!
//! let mut stream = source.subscribe(&["inventory-events"]).await?;
//! while let Some(result) = stream.next().await {
//!     let delivery = result?;
//!     handle(&delivery.payload).await?;
//!     delivery.ack();
//! }
//! ```

use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while reading from the event source.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to commit consumed offsets
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Generic error for other failures
    #[error("Event bus error: {0}")]
    Other(String),
}

/// Acknowledgement handle attached to a delivery.
pub trait Acknowledge: Send {
    /// Mark the delivery as processed.
    fn ack(self: Box<Self>);
}

/// One message read from the broker.
pub struct Delivery {
    /// Topic the message was read from
    pub topic: String,
    /// Partitioning key, `location/item` by convention
    pub key: Option<String>,
    /// Raw envelope bytes
    pub payload: Vec<u8>,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Wrap a payload with its acknowledgement handle.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        key: Option<String>,
        payload: Vec<u8>,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            topic: topic.into(),
            key,
            payload,
            acker,
        }
    }

    /// Acknowledge the delivery. Dropping it instead leaves it for redelivery.
    pub fn ack(self) {
        self.acker.ack();
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("key", &self.key)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Trait for broker consumer implementations.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the consumer can hold an
/// `Arc<dyn EventSource>`.
pub trait EventSource: Send + Sync {
    /// Subscribe to one or more topics.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>>;
}
