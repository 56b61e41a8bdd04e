//! Broker consumer feeding the ingestion pipeline.
//!
//! # Pattern: Subscribe-Process-Reconnect Loop
//!
//! ```text
//! loop {
//!     subscribe:
//!         loop {
//!             next delivery -> route by position key -> worker queue
//!             check shutdown signal
//!         }
//!         if stream ended or subscription failed:
//!             wait and retry
//! }
//! ```
//!
//! Deliveries are fanned out to a fixed set of workers by hashing the
//! position key. A key always maps to the same worker and each worker handles
//! its queue in order, so events for one position are applied in delivery
//! order while different positions proceed in parallel.
//!
//! A delivery is acknowledged once the pipeline reports a terminal outcome
//! (applied, deduplicated or dead-lettered). If the failure could not be
//! dead-lettered the delivery is dropped unacknowledged and the broker
//! redelivers it.

use crate::ingest::IngestPipeline;
use futures::StreamExt;
use inventory_sync_core::event::RawInventoryEvent;
use inventory_sync_core::event_bus::{Delivery, DeliveryStream, EventSource};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum StreamEnd {
    Shutdown,
    Ended,
}

/// Consumes deliveries from an [`EventSource`] and ingests them.
///
/// # Lifecycle
///
/// 1. Created via [`IngestionConsumer::new`]
/// 2. Spawned as a background task via [`spawn`](Self::spawn)
/// 3. Runs until the shutdown signal fires, then lets the workers finish
///    what is already queued
pub struct IngestionConsumer {
    name: String,
    topics: Vec<String>,
    source: Arc<dyn EventSource>,
    pipeline: Arc<IngestPipeline>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
    workers: usize,
    queue_depth: usize,
}

impl IngestionConsumer {
    /// Create a consumer with one worker and a 5 second reconnect delay.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        topics: Vec<String>,
        source: Arc<dyn EventSource>,
        pipeline: Arc<IngestPipeline>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            topics,
            source,
            pipeline,
            shutdown,
            retry_delay: Duration::from_secs(5),
            workers: 1,
            queue_depth: 256,
        }
    }

    /// Set the number of key-partitioned workers.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the delay before resubscribing after a failure.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set how many deliveries each worker may have queued.
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, workers = self.workers, "Ingestion consumer started");

        let (queues, workers): (Vec<_>, Vec<_>) = (0..self.workers)
            .map(|index| {
                let (tx, rx) = mpsc::channel(self.queue_depth);
                (tx, self.spawn_worker(index, rx))
            })
            .unzip();

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

            let subscribed = tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Ingestion consumer received shutdown signal");
                    break;
                }
                result = self.source.subscribe(&topics) => result,
            };

            match subscribed {
                Ok(mut stream) => {
                    info!(consumer = %self.name, topics = ?self.topics, "Subscribed to event source");
                    if let StreamEnd::Shutdown = self.process_stream(&mut stream, &queues).await {
                        break;
                    }
                    warn!(
                        consumer = %self.name,
                        retry_delay_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX),
                        "Event stream ended, reconnecting"
                    );
                },
                Err(e) => {
                    error!(
                        consumer = %self.name,
                        error = %e,
                        retry_delay_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX),
                        "Failed to subscribe to event source"
                    );
                },
            }

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Ingestion consumer received shutdown signal");
                    break;
                }
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        drop(queues);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(consumer = %self.name, error = %e, "Ingestion worker panicked");
            }
        }

        info!(consumer = %self.name, "Ingestion consumer stopped");
    }

    async fn process_stream(
        &mut self,
        stream: &mut DeliveryStream,
        queues: &[mpsc::Sender<Delivery>],
    ) -> StreamEnd {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Ingestion consumer received shutdown signal during processing");
                    return StreamEnd::Shutdown;
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        let index = worker_index(&delivery, queues.len());
                        if queues[index].send(delivery).await.is_err() {
                            error!(consumer = %self.name, worker = index, "Ingestion worker gone");
                            return StreamEnd::Ended;
                        }
                    },
                    Some(Err(e)) => {
                        error!(consumer = %self.name, error = %e, "Error receiving delivery");
                    },
                    None => return StreamEnd::Ended,
                },
            }
        }
    }

    fn spawn_worker(&self, index: usize, mut queue: mpsc::Receiver<Delivery>) -> JoinHandle<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let consumer = self.name.clone();
        tokio::spawn(async move {
            while let Some(delivery) = queue.recv().await {
                let outcome = pipeline.ingest(&delivery.payload).await;
                if outcome.should_ack() {
                    delivery.ack();
                } else {
                    warn!(
                        consumer = %consumer,
                        worker = index,
                        topic = %delivery.topic,
                        "Delivery left unacknowledged for redelivery"
                    );
                }
            }
            debug!(consumer = %consumer, worker = index, "Ingestion worker drained");
        })
    }
}

/// Pick the worker for a delivery.
///
/// Uses the broker key when present, falling back to the key inside the
/// payload. Payloads with no readable key all go to worker 0.
fn worker_index(delivery: &Delivery, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    let routing_key = delivery.key.clone().or_else(|| {
        RawInventoryEvent::from_json(&delivery.payload)
            .ok()
            .and_then(|raw| raw.key_hint())
            .map(|key| key.to_string())
    });
    let Some(routing_key) = routing_key else {
        return 0;
    };

    let mut hasher = DefaultHasher::new();
    routing_key.hash(&mut hasher);
    #[allow(clippy::cast_possible_truncation)] // Only the low bits pick a worker
    let index = (hasher.finish() as usize) % workers;
    index
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use inventory_sync_core::event_bus::Acknowledge;

    struct NoAck;

    impl Acknowledge for NoAck {
        fn ack(self: Box<Self>) {}
    }

    fn delivery(key: Option<&str>, payload: &str) -> Delivery {
        Delivery::new(
            "inventory-events",
            key.map(str::to_string),
            payload.as_bytes().to_vec(),
            Box::new(NoAck),
        )
    }

    #[test]
    fn routes_by_payload_key_when_broker_key_is_absent() {
        let payload = r#"{"locationId":"store-1","itemId":"sku-1"}"#;
        let keyed = worker_index(&delivery(Some("store-1/sku-1"), "{}"), 8);
        let from_payload = worker_index(&delivery(None, payload), 8);
        assert_eq!(keyed, from_payload);
    }

    #[test]
    fn unreadable_payloads_go_to_the_first_worker() {
        assert_eq!(worker_index(&delivery(None, "not json"), 8), 0);
        assert_eq!(worker_index(&delivery(Some("any"), "{}"), 1), 0);
    }
}
