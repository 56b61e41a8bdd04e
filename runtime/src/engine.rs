//! Wiring of the engine's components from configuration and collaborators.

use crate::availability::AvailabilityCalculator;
use crate::config::SyncConfig;
use crate::dead_letter::{DeadLetterManager, Redeliver};
use crate::ingest::IngestPipeline;
use crate::ledger::IdempotencyLedger;
use crate::reconcile::{ReconciliationScheduler, spawn_housekeeping};
use crate::store::PositionStore;
use inventory_sync_core::audit::AuditSink;
use inventory_sync_core::dead_letter::DeadLetterStore;
use inventory_sync_core::environment::Clock;
use inventory_sync_core::policy::{ReceiptSchedule, SafetyStockPolicy};
use inventory_sync_core::reconciliation::SourceOfRecord;
use inventory_sync_core::store::EventApplier;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// External collaborators the engine is composed from.
#[derive(Clone)]
pub struct Collaborators {
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Audit and alert channel
    pub audit: Arc<dyn AuditSink>,
    /// Where failed events are held
    pub dead_letter_store: Arc<dyn DeadLetterStore>,
    /// Expected receipts for ATP
    pub receipts: Arc<dyn ReceiptSchedule>,
    /// Authoritative on-hand quantities
    pub source_of_record: Arc<dyn SourceOfRecord>,
    /// Safety stock per position
    pub safety_stock: Arc<dyn SafetyStockPolicy>,
}

/// The assembled engine.
///
/// Every component shares one ledger, one position store and one dead-letter
/// manager. Reconciliation corrections go through the same pipeline as
/// broker events.
pub struct SyncEngine {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    ledger: Arc<IdempotencyLedger>,
    store: Arc<PositionStore>,
    availability: Arc<AvailabilityCalculator>,
    dead_letters: Arc<DeadLetterManager>,
    pipeline: Arc<IngestPipeline>,
    reconciler: Arc<ReconciliationScheduler>,
}

impl SyncEngine {
    /// Assemble the engine.
    #[must_use]
    pub fn new(config: SyncConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            clock,
            audit,
            dead_letter_store,
            receipts,
            source_of_record,
            safety_stock,
        } = collaborators;

        let ledger = Arc::new(IdempotencyLedger::new(config.idempotency_retention));
        let store = Arc::new(PositionStore::new(
            Arc::clone(&ledger),
            safety_stock,
            Arc::clone(&clock),
            config.key_lock_timeout,
        ));
        let availability = Arc::new(AvailabilityCalculator::new(
            Arc::clone(&store),
            receipts,
            Arc::clone(&clock),
            config.pending_receipt_horizon,
        ));
        let dead_letters = Arc::new(DeadLetterManager::new(
            dead_letter_store,
            Arc::clone(&audit),
            Arc::clone(&clock),
            config.dead_letter_policy(),
            config.dead_letter_sweep_batch,
        ));
        let applier: Arc<dyn EventApplier> = Arc::clone(&store) as Arc<dyn EventApplier>;
        let pipeline = Arc::new(IngestPipeline::new(
            applier,
            Arc::clone(&dead_letters),
            Arc::clone(&audit),
            Arc::clone(&clock),
            config.ingest_retry_policy(),
            config.event_processing_timeout,
        ));
        let reconciler = Arc::new(ReconciliationScheduler::new(
            Arc::clone(&store),
            Arc::clone(&pipeline),
            source_of_record,
            audit,
            Arc::clone(&clock),
            config.reconciliation_settings(),
        ));

        Self {
            config,
            clock,
            ledger,
            store,
            availability,
            dead_letters,
            pipeline,
            reconciler,
        }
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Idempotency ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<IdempotencyLedger> {
        &self.ledger
    }

    /// Position store.
    #[must_use]
    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    /// Availability calculator.
    #[must_use]
    pub fn availability(&self) -> &Arc<AvailabilityCalculator> {
        &self.availability
    }

    /// Dead-letter manager.
    #[must_use]
    pub fn dead_letters(&self) -> &Arc<DeadLetterManager> {
        &self.dead_letters
    }

    /// Ingestion pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    /// Reconciliation scheduler.
    #[must_use]
    pub fn reconciler(&self) -> &Arc<ReconciliationScheduler> {
        &self.reconciler
    }

    /// Spawn the timers: dead-letter sweeper, reconciliation and ledger
    /// housekeeping. Each stops when `shutdown` fires.
    #[must_use]
    pub fn spawn_background(
        &self,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<(&'static str, JoinHandle<()>)> {
        let redeliver: Arc<dyn Redeliver> = Arc::clone(&self.pipeline) as Arc<dyn Redeliver>;
        vec![
            (
                "dead-letter-sweeper",
                Arc::clone(&self.dead_letters).spawn_sweeper(
                    redeliver,
                    self.config.dead_letter_sweep_interval,
                    shutdown.subscribe(),
                ),
            ),
            (
                "reconciliation",
                Arc::clone(&self.reconciler).spawn(shutdown.subscribe()),
            ),
            (
                "ledger-housekeeping",
                spawn_housekeeping(
                    Arc::clone(&self.ledger),
                    Arc::clone(&self.clock),
                    self.config.ledger_housekeeping_interval,
                    shutdown.subscribe(),
                ),
            ),
        ]
    }
}
