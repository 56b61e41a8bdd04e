//! Periodic reconciliation against the source of record.
//!
//! Each cycle reads the local on-hand quantity of every known key, asks the
//! source of record for the same keys and compares. Small differences are
//! corrected with a synthetic `ADJUSTMENT` submitted through the ingestion
//! pipeline; large ones are left alone and surfaced for manual review.
//!
//! A correction carries a deterministic event ID built from the discrepancy
//! signature (key, delta, time bucket), so a repeated cycle in the same bucket
//! deduplicates in the ledger even if the scheduler's own bookkeeping is lost.

use crate::ingest::{IngestOutcome, IngestPipeline};
use crate::ledger::IdempotencyLedger;
use crate::metrics::ReconciliationMetrics;
use crate::schedule::spawn_periodic;
use crate::store::PositionStore;
use chrono::{DateTime, Utc};
use inventory_sync_core::audit::{AlertSeverity, AuditRecord, AuditSink, DiscrepancyResolution};
use inventory_sync_core::environment::{Clock, chrono_duration};
use inventory_sync_core::event::{EventId, EventType, InventoryChangeEvent};
use inventory_sync_core::position::PositionKey;
use inventory_sync_core::reconciliation::{
    ReconciliationDiscrepancy, SourceOfRecord, SourceOfRecordError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

const SOURCE_SYSTEM: &str = "reconciliation";

/// Tunables for [`ReconciliationScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationSettings {
    /// Largest |delta| corrected automatically
    pub auto_correct_threshold: u64,
    /// Time between cycles, also the width of a signature bucket
    pub interval: Duration,
    /// Deadline for one source-of-record query
    pub source_timeout: Duration,
    /// Consecutive skipped cycles before an alert is raised
    pub escalation_cycles: u32,
    /// How long a corrected key is left alone
    pub settle_window: Duration,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            auto_correct_threshold: 5,
            interval: Duration::from_secs(15 * 60),
            source_timeout: Duration::from_secs(30),
            escalation_cycles: 3,
            settle_window: Duration::from_secs(15 * 60),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    /// The source of record could not be queried; nothing was compared.
    Skipped {
        /// Why
        reason: SourceOfRecordError,
        /// Skipped cycles in a row, this one included
        consecutive_failures: u32,
    },
    /// The comparison ran.
    Completed {
        /// Keys compared
        compared: usize,
        /// Keys whose quantities differed
        discrepancies: usize,
        /// Differences corrected automatically
        corrected: usize,
        /// Differences left for manual review
        escalated: usize,
        /// Keys skipped because a recent correction is still settling
        settling: usize,
    },
}

#[derive(Debug, Default)]
struct CycleState {
    consecutive_failures: u32,
    corrected: HashMap<(PositionKey, i64, i64), DateTime<Utc>>,
    last_correction: HashMap<PositionKey, DateTime<Utc>>,
    under_review: HashMap<PositionKey, i64>,
}

/// Compares local positions against the source of record on a timer.
pub struct ReconciliationScheduler {
    store: Arc<PositionStore>,
    pipeline: Arc<IngestPipeline>,
    source: Arc<dyn SourceOfRecord>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    settings: ReconciliationSettings,
    state: Mutex<CycleState>,
}

impl ReconciliationScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(
        store: Arc<PositionStore>,
        pipeline: Arc<IngestPipeline>,
        source: Arc<dyn SourceOfRecord>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        settings: ReconciliationSettings,
    ) -> Self {
        Self {
            store,
            pipeline,
            source,
            audit,
            clock,
            settings,
            state: Mutex::new(CycleState::default()),
        }
    }

    /// Settings in effect.
    #[must_use]
    pub const fn settings(&self) -> &ReconciliationSettings {
        &self.settings
    }

    fn bucket(&self, at: DateTime<Utc>) -> i64 {
        let width = i64::try_from(self.settings.interval.as_secs().max(1)).unwrap_or(i64::MAX);
        at.timestamp().div_euclid(width)
    }

    /// Run one reconciliation cycle.
    ///
    /// Cycles are serialized; a cycle started while another is running waits
    /// for it.
    #[tracing::instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleReport {
        let mut state = self.state.lock().await;
        let keys = self.store.keys();

        let source = match self.fetch(&keys).await {
            Ok(source) => source,
            Err(reason) => return self.skip(&mut state, reason).await,
        };
        if state.consecutive_failures > 0 {
            tracing::info!(
                skipped_cycles = state.consecutive_failures,
                "Source of record reachable again"
            );
        }
        state.consecutive_failures = 0;

        let now = self.clock.now();
        let bucket = self.bucket(now);
        let settle = chrono_duration(self.settings.settle_window);
        state.corrected.retain(|_, at| now - *at < settle + chrono_duration(self.settings.interval));
        state.last_correction.retain(|_, at| now - *at < settle);

        let mut compared = 0;
        let mut discrepancies = 0;
        let mut corrected = 0;
        let mut escalated = 0;
        let mut settling = 0;

        for key in keys {
            let Some(&source_qty) = source.get(&key) else {
                tracing::debug!(key = %key, "Source of record does not track key, skipping");
                continue;
            };
            if state.last_correction.contains_key(&key) {
                settling += 1;
                continue;
            }

            compared += 1;
            let local = self.store.get(&key).await;
            let Some(discrepancy) =
                ReconciliationDiscrepancy::detect(key.clone(), local.on_hand_qty, source_qty, now)
            else {
                state.under_review.remove(&key);
                if let Err(e) = self.store.mark_synced(&key, now).await {
                    tracing::warn!(key = %key, error = %e, "Could not stamp sync time");
                }
                continue;
            };
            discrepancies += 1;

            let resolution = if discrepancy.magnitude() <= self.settings.auto_correct_threshold {
                let signature = (key.clone(), discrepancy.delta, bucket);
                if state.corrected.contains_key(&signature) {
                    settling += 1;
                    continue;
                }
                let resolution = self.correct(&discrepancy, bucket).await;
                if resolution == DiscrepancyResolution::AutoCorrected {
                    state.corrected.insert(signature, now);
                    state.last_correction.insert(key.clone(), now);
                    state.under_review.remove(&key);
                    if let Err(e) = self.store.mark_synced(&key, now).await {
                        tracing::warn!(key = %key, error = %e, "Could not stamp sync time");
                    }
                    corrected += 1;
                } else {
                    self.alert(
                        AlertSeverity::Warning,
                        key.to_string(),
                        format!(
                            "Auto-correction of {} failed; will retry next cycle",
                            discrepancy.delta
                        ),
                    )
                    .await;
                }
                resolution
            } else {
                escalated += 1;
                let first_report = state.under_review.insert(key.clone(), discrepancy.delta)
                    != Some(discrepancy.delta);
                if first_report {
                    self.alert(
                        AlertSeverity::High,
                        key.to_string(),
                        format!(
                            "On-hand differs from source of record by {} (local {}, source {}); manual review required",
                            discrepancy.delta, discrepancy.local_qty, discrepancy.source_qty
                        ),
                    )
                    .await;
                }
                tracing::warn!(
                    key = %key,
                    local_qty = discrepancy.local_qty,
                    source_qty = discrepancy.source_qty,
                    delta = discrepancy.delta,
                    "Discrepancy above auto-correct threshold, left for manual review"
                );
                DiscrepancyResolution::ManualReview
            };

            ReconciliationMetrics::record_discrepancy(resolution);
            self.record(AuditRecord::Discrepancy {
                discrepancy,
                resolution,
            })
            .await;
        }

        tracing::info!(
            compared,
            discrepancies,
            corrected,
            escalated,
            settling,
            "Reconciliation cycle finished"
        );
        ReconciliationMetrics::record_cycle("completed");
        CycleReport::Completed {
            compared,
            discrepancies,
            corrected,
            escalated,
            settling,
        }
    }

    async fn fetch(
        &self,
        keys: &[PositionKey],
    ) -> Result<HashMap<PositionKey, u64>, SourceOfRecordError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        match tokio::time::timeout(self.settings.source_timeout, self.source.on_hand(keys)).await {
            Ok(result) => result,
            Err(_) => Err(SourceOfRecordError::Timeout(self.settings.source_timeout)),
        }
    }

    async fn skip(&self, state: &mut CycleState, reason: SourceOfRecordError) -> CycleReport {
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let consecutive_failures = state.consecutive_failures;
        tracing::warn!(
            error = %reason,
            consecutive_failures,
            "Source of record unavailable, reconciliation cycle skipped"
        );
        ReconciliationMetrics::record_cycle("skipped");

        if consecutive_failures == self.settings.escalation_cycles {
            tracing::error!(consecutive_failures, "Source of record outage persists");
            self.alert(
                AlertSeverity::High,
                "source-of-record".to_string(),
                format!(
                    "Reconciliation skipped {consecutive_failures} cycles in a row: {reason}"
                ),
            )
            .await;
        }

        CycleReport::Skipped {
            reason,
            consecutive_failures,
        }
    }

    async fn correct(
        &self,
        discrepancy: &ReconciliationDiscrepancy,
        bucket: i64,
    ) -> DiscrepancyResolution {
        let key = &discrepancy.key;
        let (bucket, delta) = (bucket.to_string(), discrepancy.delta.to_string());
        let event_id = EventId::derived(
            "recon",
            &[key.location_id.as_str(), key.item_id.as_str(), bucket.as_str(), delta.as_str()],
        );
        let target = i64::try_from(discrepancy.source_qty).unwrap_or(i64::MAX);
        let event = match InventoryChangeEvent::new(
            event_id.clone(),
            EventType::Adjustment,
            key.clone(),
            target,
            SOURCE_SYSTEM,
            discrepancy.detected_at,
            event_id.as_str(),
        ) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Could not build correction event");
                return DiscrepancyResolution::CorrectionFailed;
            },
        };

        match self.pipeline.submit(&event).await {
            IngestOutcome::Applied { .. } | IngestOutcome::Deduplicated { .. } => {
                tracing::info!(
                    key = %key,
                    delta = discrepancy.delta,
                    on_hand = discrepancy.source_qty,
                    "Discrepancy auto-corrected"
                );
                DiscrepancyResolution::AutoCorrected
            },
            outcome => {
                tracing::error!(key = %key, outcome = ?outcome, "Auto-correction failed");
                DiscrepancyResolution::CorrectionFailed
            },
        }
    }

    async fn alert(&self, severity: AlertSeverity, subject: String, message: String) {
        self.record(AuditRecord::Alert {
            severity,
            subject,
            message,
            at: self.clock.now(),
        })
        .await;
    }

    async fn record(&self, record: AuditRecord) {
        if let Err(e) = self.audit.record(record).await {
            tracing::warn!(error = %e, "Failed to write audit record");
        }
    }

    /// Run [`run_cycle`](Self::run_cycle) every interval until shutdown.
    #[must_use]
    pub fn spawn(self: Arc<Self>, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let interval = self.settings.interval;
        spawn_periodic("reconciliation", interval, shutdown, move || {
            let scheduler = Arc::clone(&self);
            async move {
                scheduler.run_cycle().await;
            }
        })
    }
}

/// Evict expired idempotency records every `interval` until shutdown.
#[must_use]
pub fn spawn_housekeeping(
    ledger: Arc<IdempotencyLedger>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    spawn_periodic("ledger-housekeeping", interval, shutdown, move || {
        let ledger = Arc::clone(&ledger);
        let clock = Arc::clone(&clock);
        async move {
            let evicted = ledger.evict_expired(clock.now());
            if evicted > 0 {
                tracing::info!(evicted, remaining = ledger.len(), "Expired idempotency records evicted");
            }
        }
    })
}
