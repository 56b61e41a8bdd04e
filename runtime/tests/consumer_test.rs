//! Ingestion consumer against the in-memory broker.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

use chrono::{DateTime, Utc};
use inventory_sync_core::audit::EventOutcome;
use inventory_sync_core::dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterId, DeadLetterStatus, DeadLetterStore,
};
use inventory_sync_core::event_bus::EventSource;
use inventory_sync_core::position::PositionKey;
use inventory_sync_runtime::{
    Collaborators, InMemoryDeadLetterStore, IngestionConsumer, SafetyStockTable, SyncConfig,
    SyncEngine,
};
use inventory_sync_testing::{
    InMemoryEventBus, RecordingAuditSink, ScriptedSourceOfRecord, StaticReceiptSchedule, builders,
    test_clock,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const TOPIC: &str = "inventory-events";
const WAIT: Duration = Duration::from_secs(5);

/// Dead-letter store that can be switched off.
#[derive(Clone, Default)]
struct SwitchableStore {
    inner: InMemoryDeadLetterStore,
    down: Arc<AtomicBool>,
}

impl SwitchableStore {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DeadLetterError> {
        if self.down.load(Ordering::SeqCst) {
            Err(DeadLetterError::Storage("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

impl DeadLetterStore for SwitchableStore {
    fn upsert(
        &self,
        entry: DeadLetterEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            self.check()?;
            self.inner.upsert(entry).await
        })
    }

    fn get<'a>(
        &'a self,
        id: &'a DeadLetterId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeadLetterEntry>, DeadLetterError>> + Send + 'a>>
    {
        Box::pin(async move {
            self.check()?;
            self.inner.get(id).await
        })
    }

    fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, DeadLetterError>> + Send + '_>>
    {
        Box::pin(async move {
            self.check()?;
            self.inner.due(now, limit).await
        })
    }

    fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, DeadLetterError>> + Send + '_>>
    {
        Box::pin(async move {
            self.check()?;
            self.inner.list(status, limit).await
        })
    }

    fn count(
        &self,
        status: DeadLetterStatus,
    ) -> Pin<Box<dyn Future<Output = Result<usize, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            self.check()?;
            self.inner.count(status).await
        })
    }
}

struct Rig {
    bus: InMemoryEventBus,
    engine: SyncEngine,
    audit: RecordingAuditSink,
    dead_letters: SwitchableStore,
    shutdown: broadcast::Sender<()>,
}

fn create_rig() -> Rig {
    let audit = RecordingAuditSink::new();
    let dead_letters = SwitchableStore::default();
    let config = SyncConfig {
        ingest_retry_delay: Duration::from_millis(1),
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(
        config,
        Collaborators {
            clock: Arc::new(test_clock()),
            audit: Arc::new(audit.clone()),
            dead_letter_store: Arc::new(dead_letters.clone()),
            receipts: Arc::new(StaticReceiptSchedule::new()),
            source_of_record: Arc::new(ScriptedSourceOfRecord::new()),
            safety_stock: Arc::new(SafetyStockTable::new(0)),
        },
    );
    let (shutdown, _) = broadcast::channel(1);
    Rig {
        bus: InMemoryEventBus::new(),
        engine,
        audit,
        dead_letters,
        shutdown,
    }
}

fn start(rig: &Rig, workers: usize) -> JoinHandle<()> {
    IngestionConsumer::new(
        "test-consumer",
        vec![TOPIC.to_string()],
        Arc::new(rig.bus.clone()) as Arc<dyn EventSource>,
        Arc::clone(rig.engine.pipeline()),
        rig.shutdown.subscribe(),
    )
    .with_workers(workers)
    .with_retry_delay(Duration::from_millis(10))
    .spawn()
}

async fn stop(rig: &Rig, handle: JoinHandle<()>) {
    let _ = rig.shutdown.send(());
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("consumer should stop on shutdown")
        .unwrap();
}

fn key(n: usize) -> PositionKey {
    PositionKey::new("store-1", format!("sku-{n}"))
}

#[tokio::test]
async fn applied_events_are_acknowledged() {
    let rig = create_rig();
    let handle = start(&rig, 1);

    rig.bus.publish(
        TOPIC,
        Some("store-1/sku-1"),
        builders::payload(&builders::receipt("E1", &key(1), 10)),
    );
    rig.bus.publish(
        TOPIC,
        Some("store-1/sku-1"),
        builders::payload(&builders::sale("E2", &key(1), 4)),
    );

    assert!(rig.bus.wait_for_acks(2, WAIT).await);
    assert_eq!(rig.engine.store().get(&key(1)).await.on_hand_qty, 6);
    stop(&rig, handle).await;
}

#[tokio::test]
async fn redelivered_duplicates_are_acknowledged_without_effect() {
    let rig = create_rig();
    let handle = start(&rig, 2);

    let payload = builders::payload(&builders::receipt("E1", &key(1), 10));
    rig.bus.publish(TOPIC, None, payload.clone());
    rig.bus.publish(TOPIC, None, payload);

    assert!(rig.bus.wait_for_acks(2, WAIT).await);
    assert_eq!(rig.engine.store().get(&key(1)).await.on_hand_qty, 10);
    let outcomes: Vec<EventOutcome> = rig.audit.outcomes().into_iter().map(|(_, o)| o).collect();
    assert_eq!(outcomes, vec![EventOutcome::Applied, EventOutcome::Deduplicated]);
    stop(&rig, handle).await;
}

#[tokio::test]
async fn malformed_payloads_are_dead_lettered_and_acknowledged() {
    let rig = create_rig();
    let handle = start(&rig, 1);

    rig.bus.publish(TOPIC, None, b"{\"eventId\":\"E9\"".to_vec());

    assert!(rig.bus.wait_for_acks(1, WAIT).await);
    assert_eq!(rig.dead_letters.inner.len(), 1);
    stop(&rig, handle).await;
}

#[tokio::test]
async fn consumer_resubscribes_after_failed_subscription() {
    let rig = create_rig();
    rig.bus.fail_next_subscribes(2);
    let handle = start(&rig, 1);

    rig.bus.publish(
        TOPIC,
        None,
        builders::payload(&builders::receipt("E1", &key(1), 3)),
    );

    assert!(rig.bus.wait_for_acks(1, WAIT).await);
    assert_eq!(rig.bus.subscriptions(), 1);
    stop(&rig, handle).await;
}

#[tokio::test]
async fn consumer_reconnects_when_stream_ends() {
    let rig = create_rig();
    let handle = start(&rig, 1);

    rig.bus.publish(
        TOPIC,
        None,
        builders::payload(&builders::receipt("E1", &key(1), 3)),
    );
    assert!(rig.bus.wait_for_acks(1, WAIT).await);

    rig.bus.disconnect();
    rig.bus.publish(
        TOPIC,
        None,
        builders::payload(&builders::receipt("E2", &key(1), 4)),
    );

    assert!(rig.bus.wait_for_acks(2, WAIT).await);
    assert!(rig.bus.subscriptions() >= 2);
    assert_eq!(rig.engine.store().get(&key(1)).await.on_hand_qty, 7);
    stop(&rig, handle).await;
}

#[tokio::test]
async fn unrecordable_failures_stay_unacknowledged_until_redelivered() {
    let rig = create_rig();
    rig.dead_letters.set_down(true);
    let handle = start(&rig, 1);

    let mut raw = builders::raw("E5", "SALE", &key(1), -1);
    raw.location_id = None;
    rig.bus.publish(TOPIC, None, builders::raw_payload(&raw));

    // The audit record comes before the dead-letter attempt.
    tokio::time::timeout(WAIT, async {
        while rig.audit.outcomes().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!rig.bus.wait_for_acks(1, Duration::from_millis(100)).await);
    assert!(!rig.bus.is_acked(TOPIC, 0));

    rig.dead_letters.set_down(false);
    rig.bus.disconnect();

    assert!(rig.bus.wait_for_acks(1, WAIT).await);
    assert!(rig.bus.is_acked(TOPIC, 0));
    let entry = rig
        .dead_letters
        .inner
        .get(&DeadLetterId::new("E5"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, DeadLetterStatus::Escalated);
    stop(&rig, handle).await;
}

#[tokio::test]
async fn events_for_one_position_apply_in_delivery_order() {
    let rig = create_rig();
    let handle = start(&rig, 8);

    let keys: Vec<PositionKey> = (0..6).map(key).collect();
    let mut expected = Vec::new();
    for (k, position) in keys.iter().enumerate() {
        let mut last = 0;
        for i in 0..25u32 {
            let target = (i * 37 + u32::try_from(k).unwrap() * 11) % 97;
            last = target;
            let id = format!("adj-{k}-{i}");
            rig.bus.publish(
                TOPIC,
                None,
                builders::payload(&builders::adjustment(&id, position, target)),
            );
        }
        expected.push(u64::from(last));
    }

    assert!(rig.bus.wait_for_acks(keys.len() * 25, WAIT).await);
    for (position, last) in keys.iter().zip(expected) {
        let stored = rig.engine.store().get(position).await;
        assert_eq!(stored.on_hand_qty, last, "position {position}");
        assert!(
            stored
                .last_applied_event_id
                .is_some_and(|id| id.ends_with("-24"))
        );
    }
    stop(&rig, handle).await;
}

#[tokio::test]
async fn shutdown_stops_an_idle_consumer() {
    let rig = create_rig();
    let handle = start(&rig, 4);
    tokio::time::sleep(Duration::from_millis(20)).await;
    stop(&rig, handle).await;
}
