//! In-memory broker with acknowledgement tracking.
//!
//! Messages are kept per topic in publish order. A subscription first yields
//! every message that has not been acknowledged yet, then follows new
//! publishes. Dropping a delivery without acknowledging it leaves the message
//! to be redelivered on the next subscription, as a real consumer group
//! would after a restart.

use async_stream::stream;
use inventory_sync_core::event_bus::{
    Acknowledge, Delivery, DeliveryStream, EventBusError, EventSource,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct Stored {
    key: Option<String>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct BusState {
    topics: HashMap<String, Vec<Stored>>,
    acked: HashSet<(String, usize)>,
    failing_subscribes: usize,
    subscriptions: usize,
    epoch: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BusState>,
    changed: watch::Sender<u64>,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }
}

struct BusAck {
    shared: Arc<Shared>,
    topic: String,
    offset: usize,
}

impl Acknowledge for BusAck {
    fn ack(self: Box<Self>) {
        let Self {
            shared,
            topic,
            offset,
        } = *self;
        shared.state().acked.insert((topic, offset));
        shared.bump();
    }
}

/// In-memory [`EventSource`].
///
/// # Example
///
/// ```
/// use futures::StreamExt;
/// use inventory_sync_core::event_bus::EventSource;
/// use inventory_sync_testing::InMemoryEventBus;
///
/// # tokio_test::block_on(async {
/// let bus = InMemoryEventBus::new();
/// bus.publish("inventory-events", Some("store-1/sku-1"), b"{}".to_vec());
///
/// let mut stream = bus.subscribe(&["inventory-events"]).await.unwrap();
/// let delivery = stream.next().await.unwrap().unwrap();
/// delivery.ack();
/// assert_eq!(bus.acked_count(), 1);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    shared: Arc<Shared>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                changed,
            }),
        }
    }

    /// Append a message to `topic`; returns its offset.
    pub fn publish(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) -> usize {
        let offset = {
            let mut state = self.shared.state();
            let log = state.topics.entry(topic.to_string()).or_default();
            log.push(Stored {
                key: key.map(str::to_string),
                payload,
            });
            log.len() - 1
        };
        self.shared.bump();
        offset
    }

    /// Fail the next `times` subscription attempts.
    pub fn fail_next_subscribes(&self, times: usize) {
        self.shared.state().failing_subscribes += times;
    }

    /// End every open subscription stream, as a dropped connection would.
    pub fn disconnect(&self) {
        self.shared.state().epoch += 1;
        self.shared.bump();
    }

    /// Messages acknowledged so far, across topics.
    #[must_use]
    pub fn acked_count(&self) -> usize {
        self.shared.state().acked.len()
    }

    /// Messages published so far, across topics.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.shared.state().topics.values().map(Vec::len).sum()
    }

    /// Whether the message at `offset` in `topic` was acknowledged.
    #[must_use]
    pub fn is_acked(&self, topic: &str, offset: usize) -> bool {
        self.shared
            .state()
            .acked
            .contains(&(topic.to_string(), offset))
    }

    /// Successful subscriptions so far.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.shared.state().subscriptions
    }

    /// Wait until `count` messages are acknowledged or `timeout` passes.
    ///
    /// Returns whether the count was reached.
    pub async fn wait_for_acks(&self, count: usize, timeout: std::time::Duration) -> bool {
        let mut changed = self.shared.changed.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                if self.acked_count() >= count {
                    return;
                }
                tokio::select! {
                    _ = changed.changed() => {}
                    () = tokio::time::sleep(std::time::Duration::from_millis(5)) => {}
                }
            }
        })
        .await
        .is_ok()
    }
}

impl EventSource for InMemoryEventBus {
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        let shared = Arc::clone(&self.shared);

        Box::pin(async move {
            let epoch = {
                let mut state = shared.state();
                if state.failing_subscribes > 0 {
                    state.failing_subscribes -= 1;
                    return Err(EventBusError::SubscriptionFailed {
                        topics,
                        reason: "injected failure".to_string(),
                    });
                }
                state.subscriptions += 1;
                state.epoch
            };

            let mut changed = shared.changed.subscribe();
            let deliveries = stream! {
                let mut cursors: HashMap<String, usize> = HashMap::new();
                loop {
                    changed.mark_unchanged();
                    let (ended, batch) = {
                        let state = shared.state();
                        let mut batch = Vec::new();
                        for topic in &topics {
                            let Some(log) = state.topics.get(topic) else { continue };
                            let cursor = cursors.entry(topic.clone()).or_insert(0);
                            for (offset, stored) in log.iter().enumerate().skip(*cursor) {
                                if !state.acked.contains(&(topic.clone(), offset)) {
                                    batch.push((topic.clone(), offset, stored.clone()));
                                }
                            }
                            *cursor = log.len();
                        }
                        (state.epoch != epoch, batch)
                    };
                    if ended {
                        break;
                    }

                    for (topic, offset, stored) in batch {
                        let acker = BusAck {
                            shared: Arc::clone(&shared),
                            topic: topic.clone(),
                            offset,
                        };
                        yield Ok::<_, EventBusError>(Delivery::new(topic, stored.key, stored.payload, Box::new(acker)));
                    }

                    if changed.changed().await.is_err() {
                        break;
                    }
                }
            };
            Ok(Box::pin(deliveries) as DeliveryStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn unacked_messages_are_redelivered_on_resubscribe() {
        let bus = InMemoryEventBus::new();
        bus.publish("t", None, b"a".to_vec());
        bus.publish("t", None, b"b".to_vec());

        let mut first = bus.subscribe(&["t"]).await.unwrap();
        first.next().await.unwrap().unwrap().ack();
        drop(first.next().await.unwrap().unwrap());
        bus.disconnect();
        assert!(first.next().await.is_none());

        let mut second = bus.subscribe(&["t"]).await.unwrap();
        let redelivered = second.next().await.unwrap().unwrap();
        assert_eq!(redelivered.payload, b"b");
        assert!(bus.is_acked("t", 0));
        assert!(!bus.is_acked("t", 1));
    }

    #[tokio::test]
    async fn injected_subscribe_failures_are_reported() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_subscribes(1);
        assert!(bus.subscribe(&["t"]).await.is_err());
        assert!(bus.subscribe(&["t"]).await.is_ok());
        assert_eq!(bus.subscriptions(), 1);
    }
}
