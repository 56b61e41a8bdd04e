//! Redpanda event source for the inventory sync engine.
//!
//! Implements [`EventSource`] on top of rdkafka, so it works against
//! Redpanda, Apache Kafka or any other Kafka-compatible broker.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed only after the engine acknowledges a delivery
//! - Workers may acknowledge out of order; a partition's committed offset
//!   only advances past a delivery once it and everything before it is
//!   acknowledged
//! - A delivery dropped without acknowledgement ends the stream, so the
//!   consumer reconnects and the broker redelivers from the last commit
//! - Ordering is guaranteed within a partition; producers key messages by
//!   `location/item`
//!
//! # Example
//!
//! ```no_run
//! use inventory_sync_redpanda::RedpandaEventSource;
//! use inventory_sync_core::event_bus::EventSource;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = RedpandaEventSource::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("inventory-sync")
//!     .build()?;
//!
//! let mut stream = source.subscribe(&["inventory-events"]).await?;
//! while let Some(result) = stream.next().await {
//!     let delivery = result?;
//!     println!("Received {} bytes", delivery.payload.len());
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

mod offsets;

pub use offsets::OffsetTracker;

use futures::StreamExt;
use inventory_sync_core::event_bus::{
    Acknowledge, Delivery, DeliveryStream, EventBusError, EventSource,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_CONSUMER_GROUP: &str = "inventory-sync";
const DEFAULT_BUFFER_SIZE: usize = 1000;

enum AckSignal {
    Acked {
        topic: String,
        partition: i32,
        offset: i64,
    },
    Dropped {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

struct KafkaAck {
    signals: mpsc::UnboundedSender<AckSignal>,
    topic: String,
    partition: i32,
    offset: i64,
    settled: bool,
}

impl KafkaAck {
    fn settle(&mut self, acked: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        let topic = std::mem::take(&mut self.topic);
        let signal = if acked {
            AckSignal::Acked {
                topic,
                partition: self.partition,
                offset: self.offset,
            }
        } else {
            AckSignal::Dropped {
                topic,
                partition: self.partition,
                offset: self.offset,
            }
        };
        // The subscription task may already be gone; the offset was never
        // committed, so the broker redelivers it either way.
        let _ = self.signals.send(signal);
    }
}

impl Acknowledge for KafkaAck {
    fn ack(mut self: Box<Self>) {
        self.settle(true);
    }
}

impl Drop for KafkaAck {
    fn drop(&mut self) {
        self.settle(false);
    }
}

/// Kafka-compatible [`EventSource`].
///
/// Each call to [`subscribe`](EventSource::subscribe) creates a fresh
/// consumer in the configured group, so resubscribing after a dropped
/// delivery resumes from the committed offsets.
#[derive(Debug, Clone)]
pub struct RedpandaEventSource {
    brokers: String,
    consumer_group: String,
    buffer_size: usize,
    auto_offset_reset: String,
    session_timeout: Duration,
}

impl RedpandaEventSource {
    /// Create a source with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if `brokers` is empty.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder for configuring the source.
    #[must_use]
    pub fn builder() -> RedpandaEventSourceBuilder {
        RedpandaEventSourceBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group every subscription joins.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    fn create_consumer(&self, topics: &[String]) -> Result<StreamConsumer, EventBusError> {
        let session_timeout_ms = self.session_timeout.as_millis().to_string();
        ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false") // Manual commit for at-least-once
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", &session_timeout_ms)
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| EventBusError::SubscriptionFailed {
                topics: topics.to_vec(),
                reason: format!("Failed to create consumer: {e}"),
            })
    }
}

/// Builder for a [`RedpandaEventSource`].
///
/// # Example
///
/// ```no_run
/// use inventory_sync_redpanda::RedpandaEventSource;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = RedpandaEventSource::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .consumer_group("inventory-sync-eu")
///     .auto_offset_reset("latest")
///     .session_timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedpandaEventSourceBuilder {
    brokers: Option<String>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl RedpandaEventSourceBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the consumer group ID.
    ///
    /// Instances sharing a group split the topic's partitions between them.
    /// Default: `inventory-sync`
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set how many deliveries may be buffered ahead of the consumer.
    ///
    /// Default: 1000. Zero is treated as one.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where a group with no committed offset starts reading.
    ///
    /// Default: `earliest`, so a new deployment does not skip events that
    /// arrived before it first joined.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the group session timeout. Default: 6 seconds.
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build the source.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if no brokers are set.
    pub fn build(self) -> Result<RedpandaEventSource, EventBusError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;

        let source = RedpandaEventSource {
            brokers,
            consumer_group: self
                .consumer_group
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
        };

        tracing::info!(
            brokers = %source.brokers,
            consumer_group = %source.consumer_group,
            buffer_size = source.buffer_size,
            auto_offset_reset = %source.auto_offset_reset,
            "RedpandaEventSource created"
        );
        Ok(source)
    }
}

fn commit(consumer: &StreamConsumer, topic: &str, partition: i32, offset: i64) {
    let mut list = TopicPartitionList::new();
    if let Err(e) = list.add_partition_offset(topic, partition, Offset::Offset(offset)) {
        tracing::warn!(topic, partition, offset, error = %e, "Invalid commit position");
        return;
    }
    if let Err(e) = consumer.commit(&list, CommitMode::Async) {
        tracing::warn!(
            topic,
            partition,
            offset,
            error = %e,
            "Failed to commit offset (messages may be redelivered)"
        );
    } else {
        tracing::trace!(topic, partition, offset, "Offset committed");
    }
}

impl EventSource for RedpandaEventSource {
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let consumer = self.create_consumer(&topics)?;
            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %self.consumer_group,
                manual_commit = true,
                "Subscribed to topics"
            );

            let (tx, mut rx) = mpsc::channel(self.buffer_size);
            let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();

            // The task owns the consumer; the stream ends when it exits.
            tokio::spawn(async move {
                let mut messages = consumer.stream();
                let mut tracker = OffsetTracker::new();

                loop {
                    tokio::select! {
                        () = tx.closed() => {
                            tracing::debug!("Delivery receiver dropped, closing subscription");
                            break;
                        }
                        Some(signal) = signal_rx.recv() => match signal {
                            AckSignal::Acked { topic, partition, offset } => {
                                if let Some(next) = tracker.acknowledged(&topic, partition, offset) {
                                    commit(&consumer, &topic, partition, next);
                                }
                            },
                            AckSignal::Dropped { topic, partition, offset } => {
                                tracing::warn!(
                                    topic = %topic,
                                    partition,
                                    offset,
                                    outstanding = tracker.outstanding(),
                                    "Delivery dropped unacknowledged, closing subscription for redelivery"
                                );
                                break;
                            },
                        },
                        next = messages.next() => match next {
                            Some(Ok(message)) => {
                                let topic = message.topic().to_string();
                                let (partition, offset) = (message.partition(), message.offset());
                                tracing::trace!(topic = %topic, partition, offset, "Received message");

                                tracker.delivered(&topic, partition, offset);
                                let acker = KafkaAck {
                                    signals: signal_tx.clone(),
                                    topic: topic.clone(),
                                    partition,
                                    offset,
                                    settled: false,
                                };
                                let delivery = Delivery::new(
                                    topic,
                                    message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                                    message.payload().unwrap_or_default().to_vec(),
                                    Box::new(acker),
                                );
                                if tx.send(Ok(delivery)).await.is_err() {
                                    break;
                                }
                            },
                            Some(Err(e)) => {
                                let err = EventBusError::TransportError(format!(
                                    "Failed to receive message: {e}"
                                ));
                                if tx.send(Err(err)).await.is_err() {
                                    break;
                                }
                            },
                            None => break,
                        },
                    }
                }

                tracing::debug!("Subscription task exiting");
            });

            let stream = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Producer for inventory envelopes, keyed by position.
///
/// Used by upstream adapters and replay tooling; the engine itself only
/// consumes.
pub struct RedpandaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl RedpandaPublisher {
    /// Create a publisher.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str, timeout: Duration) -> Result<Self, EventBusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;
        Ok(Self { producer, timeout })
    }

    /// Publish one payload under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::TransportError`] if the broker does not
    /// accept the message.
    pub async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(i32, i64), EventBusError> {
        let record = FutureRecord::to(topic).payload(payload).key(key);
        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(topic, key, partition, offset, "Envelope published");
                Ok((partition, offset))
            },
            Err((e, _)) => {
                tracing::error!(topic, key, error = %e, "Failed to publish envelope");
                Err(EventBusError::TransportError(e.to_string()))
            },
        }
    }
}
