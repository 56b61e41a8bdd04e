//! End-to-end scenarios through the assembled engine.
//!
//! Each test wires a full `SyncEngine` with in-memory collaborators and a
//! manual clock, then drives it the way the broker, callers and the timers
//! would.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

use inventory_sync_core::Clock;
use inventory_sync_core::audit::{AlertSeverity, AuditRecord, DiscrepancyResolution, EventOutcome};
use inventory_sync_core::dead_letter::{DeadLetterId, DeadLetterStatus, DeadLetterStore};
use inventory_sync_core::event::{EventId, ValidationError};
use inventory_sync_core::position::PositionKey;
use inventory_sync_core::reconciliation::SourceOfRecordError;
use inventory_sync_core::store::StoreError;
use inventory_sync_runtime::availability::{RejectionReason, ReservationOutcome};
use inventory_sync_runtime::ingest::IngestOutcome;
use inventory_sync_runtime::reconcile::CycleReport;
use inventory_sync_runtime::{
    Collaborators, InMemoryDeadLetterStore, SafetyStockTable, SyncConfig, SyncEngine,
};
use inventory_sync_testing::{
    ManualClock, RecordingAuditSink, ScriptedSourceOfRecord, StaticReceiptSchedule, builders,
    test_clock,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: SyncEngine,
    clock: ManualClock,
    audit: RecordingAuditSink,
    source: ScriptedSourceOfRecord,
    receipts: StaticReceiptSchedule,
    dead_letters: InMemoryDeadLetterStore,
}

fn test_config() -> SyncConfig {
    SyncConfig {
        ingest_retry_delay: Duration::from_millis(1),
        source_of_record_timeout: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

fn create_harness(safety_stock: u64, config: SyncConfig) -> Harness {
    let clock = test_clock();
    let audit = RecordingAuditSink::new();
    let source = ScriptedSourceOfRecord::new();
    let receipts = StaticReceiptSchedule::new();
    let dead_letters = InMemoryDeadLetterStore::new();

    let engine = SyncEngine::new(
        config,
        Collaborators {
            clock: Arc::new(clock.clone()),
            audit: Arc::new(audit.clone()),
            dead_letter_store: Arc::new(dead_letters.clone()),
            receipts: Arc::new(receipts.clone()),
            source_of_record: Arc::new(source.clone()),
            safety_stock: Arc::new(SafetyStockTable::new(safety_stock)),
        },
    );

    Harness {
        engine,
        clock,
        audit,
        source,
        receipts,
        dead_letters,
    }
}

fn key() -> PositionKey {
    PositionKey::new("store-1", "sku-1")
}

async fn seed_on_hand(h: &Harness, qty: u32) {
    let outcome = h
        .engine
        .pipeline()
        .ingest(&builders::payload(&builders::receipt("seed", &key(), qty)))
        .await;
    assert!(matches!(outcome, IngestOutcome::Applied { .. }));
}

/// Second reservation that exceeds the remaining ATP is rejected.
#[tokio::test]
async fn reservation_beyond_atp_is_rejected() {
    let h = create_harness(10, test_config());
    seed_on_hand(&h, 100).await;
    let atp = h.engine.availability();

    let first = atp.reserve(&key(), 85).await.unwrap();
    let ReservationOutcome::Accepted { position, .. } = first else {
        panic!("expected acceptance, got {first:?}");
    };
    assert_eq!(position.allocated_qty, 85);
    assert_eq!(atp.compute_atp(&key()).await, 5);

    let second = atp.reserve(&key(), 10).await.unwrap();
    let ReservationOutcome::Rejected { reason, position } = second else {
        panic!("expected rejection, got {second:?}");
    };
    assert_eq!(
        reason,
        RejectionReason::InsufficientAvailability {
            requested: 10,
            available: 5
        }
    );
    assert_eq!(reason.to_string(), "insufficient availability");
    assert_eq!(position.allocated_qty, 85);
    assert_eq!(h.engine.store().get(&key()).await.allocated_qty, 85);
}

/// A redelivered sale leaves on hand unchanged.
#[tokio::test]
async fn redelivered_sale_is_applied_once() {
    let h = create_harness(0, test_config());
    seed_on_hand(&h, 100).await;

    let sale = builders::payload(&builders::sale("E1", &key(), 20));
    let first = h.engine.pipeline().ingest(&sale).await;
    let IngestOutcome::Applied { position, .. } = first else {
        panic!("expected applied, got {first:?}");
    };
    assert_eq!(position.on_hand_qty, 80);

    let again = h.engine.pipeline().ingest(&sale).await;
    let IngestOutcome::Deduplicated { position } = again else {
        panic!("expected deduplicated, got {again:?}");
    };
    assert_eq!(position.on_hand_qty, 80);
    assert_eq!(h.engine.store().get(&key()).await.on_hand_qty, 80);

    let outcomes = h.audit.outcomes();
    assert_eq!(
        outcomes,
        vec![
            (Some("seed".to_string()), EventOutcome::Applied),
            (Some("E1".to_string()), EventOutcome::Applied),
            (Some("E1".to_string()), EventOutcome::Deduplicated),
        ]
    );
}

/// A small discrepancy is corrected and the next cycle finds nothing.
#[tokio::test]
async fn small_discrepancy_is_auto_corrected_and_converges() {
    let h = create_harness(0, test_config());
    seed_on_hand(&h, 50).await;
    h.source.set(key(), 45);

    let report = h.engine.reconciler().run_cycle().await;
    assert_eq!(
        report,
        CycleReport::Completed {
            compared: 1,
            discrepancies: 1,
            corrected: 1,
            escalated: 0,
            settling: 0,
        }
    );
    let corrected = h.engine.store().get(&key()).await;
    assert_eq!(corrected.on_hand_qty, 45);
    assert_eq!(corrected.last_sync_time, Some(h.clock.now()));

    let discrepancies = h.audit.discrepancies();
    assert_eq!(discrepancies.len(), 1);
    let AuditRecord::Discrepancy {
        discrepancy,
        resolution,
    } = &discrepancies[0]
    else {
        unreachable!();
    };
    assert_eq!(discrepancy.delta, -5);
    assert_eq!(*resolution, DiscrepancyResolution::AutoCorrected);

    h.clock.advance(h.engine.config().reconciliation_interval);
    let next = h.engine.reconciler().run_cycle().await;
    assert_eq!(
        next,
        CycleReport::Completed {
            compared: 1,
            discrepancies: 0,
            corrected: 0,
            escalated: 0,
            settling: 0,
        }
    );
    let position = h.engine.store().get(&key()).await;
    assert_eq!(position.on_hand_qty, 45);
    assert_eq!(position.last_sync_time, Some(h.clock.now()));
}

/// Keys whose IDs join to the same text are corrected independently.
#[tokio::test]
async fn corrections_for_lookalike_keys_do_not_collide() {
    let h = create_harness(0, test_config());
    let left = PositionKey::new("a-b", "c");
    let right = PositionKey::new("a", "b-c");
    for (id, position) in [("seed-left", &left), ("seed-right", &right)] {
        h.engine
            .pipeline()
            .ingest(&builders::payload(&builders::receipt(id, position, 50)))
            .await;
        h.source.set(position.clone(), 47);
    }

    let report = h.engine.reconciler().run_cycle().await;
    assert!(matches!(
        report,
        CycleReport::Completed {
            compared: 2,
            corrected: 2,
            ..
        }
    ));
    assert_eq!(h.engine.store().get(&left).await.on_hand_qty, 47);
    assert_eq!(h.engine.store().get(&right).await.on_hand_qty, 47);
}

/// A large discrepancy is surfaced and the position is left alone.
#[tokio::test]
async fn large_discrepancy_goes_to_manual_review() {
    let h = create_harness(0, test_config());
    seed_on_hand(&h, 50).await;
    h.source.set(key(), 30);

    let report = h.engine.reconciler().run_cycle().await;
    assert!(matches!(
        report,
        CycleReport::Completed {
            discrepancies: 1,
            corrected: 0,
            escalated: 1,
            ..
        }
    ));
    assert_eq!(h.engine.store().get(&key()).await.on_hand_qty, 50);

    let discrepancies = h.audit.discrepancies();
    assert!(matches!(
        &discrepancies[..],
        [AuditRecord::Discrepancy {
            resolution: DiscrepancyResolution::ManualReview,
            ..
        }]
    ));
    assert_eq!(h.audit.alerts().len(), 1);

    // Still unresolved next cycle: reported again, alerted once.
    h.clock.advance(h.engine.config().reconciliation_interval);
    h.engine.reconciler().run_cycle().await;
    assert_eq!(h.audit.discrepancies().len(), 2);
    assert_eq!(h.audit.alerts().len(), 1);
    assert_eq!(h.engine.store().get(&key()).await.on_hand_qty, 50);
}

/// An event without a location is dead-lettered once with zero attempts.
#[tokio::test]
async fn malformed_event_is_dead_lettered_once() {
    let h = create_harness(0, test_config());
    let mut raw = builders::raw("E-bad", "SALE", &key(), -1);
    raw.location_id = None;
    let payload = builders::raw_payload(&raw);

    let outcome = h.engine.pipeline().ingest(&payload).await;
    assert_eq!(
        outcome,
        IngestOutcome::DeadLettered {
            id: DeadLetterId::new("E-bad"),
            status: DeadLetterStatus::Escalated,
        }
    );

    // Redelivery of the same bad payload updates the same entry.
    h.engine.pipeline().ingest(&payload).await;
    assert_eq!(h.dead_letters.len(), 1);

    let entry = h
        .dead_letters
        .get(&DeadLetterId::new("E-bad"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.attempts, 0);
    assert_eq!(entry.status, DeadLetterStatus::Escalated);
    assert_eq!(entry.payload, payload);
    assert!(!h.engine.store().contains(&key()));

    let alerts = h.audit.alerts();
    assert_eq!(alerts.len(), 1);
    assert!(matches!(
        &alerts[0],
        AuditRecord::Alert {
            severity: AlertSeverity::High,
            subject,
            ..
        } if subject == "E-bad"
    ));
}

/// Pending receipts count toward ATP only up to what is in transit.
#[tokio::test]
async fn pending_receipts_raise_atp_within_in_transit() {
    let h = create_harness(0, test_config());
    let mut position = inventory_sync_core::position::InventoryPosition::empty(&key());
    position.on_hand_qty = 10;
    position.in_transit_qty = 20;
    h.engine.store().restore([position]).await;

    h.receipts.set(key(), 50);
    assert_eq!(h.engine.availability().compute_atp(&key()).await, 30);

    let accepted = h.engine.availability().reserve(&key(), 25).await.unwrap();
    assert!(accepted.is_accepted());

    h.receipts.set_failing(true);
    assert_eq!(h.engine.availability().compute_atp(&key()).await, 0);
}

/// Releasing more than is allocated clamps and still acknowledges.
#[tokio::test]
async fn over_release_clamps_at_zero() {
    let h = create_harness(0, test_config());
    seed_on_hand(&h, 10).await;
    h.engine.availability().reserve(&key(), 4).await.unwrap();

    let ack = h.engine.availability().release(&key(), 9).await.unwrap();
    assert!(ack.clamped);
    assert_eq!(ack.position.allocated_qty, 0);
}

/// Reserving with a retried ID does not allocate twice.
#[tokio::test]
async fn retried_reservation_id_is_idempotent() {
    let h = create_harness(0, test_config());
    seed_on_hand(&h, 10).await;
    let atp = h.engine.availability();
    let id = EventId::new("order-1");

    assert!(atp.reserve_with_id(id.clone(), &key(), 6).await.unwrap().is_accepted());
    assert!(atp.reserve_with_id(id, &key(), 6).await.unwrap().is_accepted());
    assert_eq!(h.engine.store().get(&key()).await.allocated_qty, 6);

    let zero = atp.reserve(&key(), 0).await.unwrap();
    assert!(matches!(
        zero,
        ReservationOutcome::Rejected {
            reason: RejectionReason::InvalidQuantity { requested: 0 },
            ..
        }
    ));
}

/// A release may carry the same ID as the reservation it frees.
#[tokio::test]
async fn release_under_the_reservation_id_frees_the_allocation() {
    let h = create_harness(0, test_config());
    seed_on_hand(&h, 10).await;
    let atp = h.engine.availability();
    let id = EventId::new("order-2");

    assert!(atp.reserve_with_id(id.clone(), &key(), 6).await.unwrap().is_accepted());
    let ack = atp.release_with_id(id.clone(), &key(), 6).await.unwrap();
    assert!(!ack.clamped);
    assert_eq!(ack.position.allocated_qty, 0);

    let again = atp.release_with_id(id.clone(), &key(), 6).await.unwrap();
    assert_eq!(again.position.allocated_qty, 0);

    let conflicting = atp.release_with_id(id, &key(), 2).await;
    assert!(matches!(
        conflicting,
        Err(StoreError::Rejected(ValidationError::ConflictingEventId(_)))
    ));
    assert_eq!(atp.compute_atp(&key()).await, 10);
}

/// A reservation ID equal to a bus event ID still allocates.
#[tokio::test]
async fn reservation_id_shared_with_a_bus_event_still_allocates() {
    let h = create_harness(0, test_config());
    seed_on_hand(&h, 10).await;
    h.engine
        .pipeline()
        .ingest(&builders::payload(&builders::sale("E9", &key(), 2)))
        .await;
    let atp = h.engine.availability();

    let outcome = atp.reserve_with_id(EventId::new("E9"), &key(), 3).await.unwrap();
    let ReservationOutcome::Accepted {
        reservation_id,
        position,
    } = outcome
    else {
        panic!("expected acceptance, got {outcome:?}");
    };
    assert_eq!(reservation_id.as_str(), "E9");
    assert_eq!(position.on_hand_qty, 8);
    assert_eq!(position.allocated_qty, 3);
    assert_eq!(atp.compute_atp(&key()).await, 5);
}

/// Reusing a reservation ID for another quantity is refused.
#[tokio::test]
async fn reservation_id_reused_for_another_quantity_is_rejected() {
    let h = create_harness(0, test_config());
    seed_on_hand(&h, 10).await;
    let atp = h.engine.availability();
    let id = EventId::new("order-3");

    assert!(atp.reserve_with_id(id.clone(), &key(), 4).await.unwrap().is_accepted());
    let reused = atp.reserve_with_id(id, &key(), 5).await.unwrap();
    let ReservationOutcome::Rejected { reason, position } = reused else {
        panic!("expected rejection, got {reused:?}");
    };
    assert_eq!(reason, RejectionReason::ConflictingRequestId { requested: 5 });
    assert_eq!(position.allocated_qty, 4);
    assert_eq!(h.engine.store().get(&key()).await.allocated_qty, 4);
}

/// Source outages skip cycles and alert once the outage persists.
#[tokio::test]
async fn unreachable_source_skips_and_escalates_after_repeated_cycles() {
    let h = create_harness(0, test_config());
    seed_on_hand(&h, 50).await;
    h.source.set(key(), 45);
    h.source
        .fail_with(SourceOfRecordError::Unreachable("connection refused".into()));

    for expected in 1..=4 {
        let report = h.engine.reconciler().run_cycle().await;
        let CycleReport::Skipped {
            consecutive_failures,
            ..
        } = report
        else {
            panic!("expected skip, got {report:?}");
        };
        assert_eq!(consecutive_failures, expected);
        h.clock.advance(h.engine.config().reconciliation_interval);
    }

    assert!(h.audit.discrepancies().is_empty());
    let alerts = h.audit.alerts();
    assert_eq!(alerts.len(), 1);
    assert!(matches!(
        &alerts[0],
        AuditRecord::Alert {
            severity: AlertSeverity::High,
            ..
        }
    ));
    assert_eq!(h.engine.store().get(&key()).await.on_hand_qty, 50);

    h.source.recover();
    let report = h.engine.reconciler().run_cycle().await;
    assert!(matches!(report, CycleReport::Completed { corrected: 1, .. }));
}

/// A source that never answers is abandoned at the deadline.
#[tokio::test]
async fn stalled_source_times_out() {
    let h = create_harness(0, test_config());
    seed_on_hand(&h, 50).await;
    h.source.stall();

    let report = h.engine.reconciler().run_cycle().await;
    assert!(matches!(
        report,
        CycleReport::Skipped {
            reason: SourceOfRecordError::Timeout(_),
            consecutive_failures: 1,
        }
    ));
}

/// A corrected key is not re-corrected while the correction settles.
#[tokio::test]
async fn recently_corrected_key_is_left_to_settle() {
    let config = SyncConfig {
        correction_settle_window: Duration::from_secs(3600),
        ..test_config()
    };
    let h = create_harness(0, config);
    seed_on_hand(&h, 50).await;
    h.source.set(key(), 45);
    h.engine.reconciler().run_cycle().await;

    // A late sale moves local away from the unchanged source again.
    h.engine
        .pipeline()
        .ingest(&builders::payload(&builders::sale("late-sale", &key(), 2)))
        .await;
    h.clock.advance(Duration::from_secs(15 * 60));

    let report = h.engine.reconciler().run_cycle().await;
    assert!(matches!(
        report,
        CycleReport::Completed {
            compared: 0,
            settling: 1,
            ..
        }
    ));
    assert_eq!(h.engine.store().get(&key()).await.on_hand_qty, 43);
}

/// Keys the source does not track are skipped, not reported.
#[tokio::test]
async fn untracked_keys_are_not_discrepancies() {
    let h = create_harness(0, test_config());
    seed_on_hand(&h, 50).await;

    let report = h.engine.reconciler().run_cycle().await;
    assert!(matches!(
        report,
        CycleReport::Completed {
            compared: 0,
            discrepancies: 0,
            ..
        }
    ));
    assert!(h.audit.discrepancies().is_empty());
}

/// Background timers stop on shutdown.
#[tokio::test]
async fn background_tasks_stop_on_shutdown() {
    let h = create_harness(0, test_config());
    let (shutdown, _) = tokio::sync::broadcast::channel(1);
    let tasks = h.engine.spawn_background(&shutdown);
    assert_eq!(tasks.len(), 3);

    shutdown.send(()).unwrap();
    for (name, task) in tasks {
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap_or_else(|_| panic!("{name} did not stop"))
            .unwrap();
    }
}
