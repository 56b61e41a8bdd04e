//! Dead-letter retry and escalation.
//!
//! Failed events are held in a [`DeadLetterStore`] and redelivered through
//! the ingestion pipeline on an exponential schedule. Once the retry ceiling
//! is reached the entry is escalated and a high-priority alert is raised.
//! Validation failures skip the schedule: the same bytes would fail the same
//! way, so they are escalated on arrival with zero attempts.
//!
//! Writes to one entry are serialized through a striped lock keyed by entry
//! ID, which keeps exactly one entry per event even when the broker redelivers
//! a failing event while a sweep is retrying it.

use crate::ingest::IngestFailure;
use crate::metrics::DeadLetterMetrics;
use crate::retry::RetryPolicy;
use crate::schedule::spawn_periodic;
use inventory_sync_core::audit::{AlertSeverity, AuditRecord, AuditSink};
use inventory_sync_core::dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterId, DeadLetterStatus, DeadLetterStore, FailureKind,
};
use inventory_sync_core::environment::{Clock, chrono_duration};
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio::task::JoinHandle;

const LOCK_STRIPES: usize = 64;

/// Something that can run a payload through ingestion again.
pub trait Redeliver: Send + Sync {
    /// Apply the payload; no dead-lettering on failure.
    ///
    /// # Errors
    ///
    /// Returns [`IngestFailure`] if the payload still cannot be applied.
    fn redeliver<'a>(
        &'a self,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), IngestFailure>> + Send + 'a>>;
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries that applied on redelivery
    pub resolved: usize,
    /// Entries that failed again and were rescheduled
    pub rescheduled: usize,
    /// Entries that hit the retry ceiling
    pub escalated: usize,
}

/// Records failures, schedules redelivery and escalates.
pub struct DeadLetterManager {
    store: Arc<dyn DeadLetterStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    sweep_batch: usize,
    stripes: Vec<Mutex<()>>,
}

impl DeadLetterManager {
    /// Create a manager.
    ///
    /// `policy.max_retries` is the number of automatic redeliveries before
    /// escalation; `policy.delay_for_attempt(n)` spaces them.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        sweep_batch: usize,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            policy,
            sweep_batch: sweep_batch.max(1),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, id: &DeadLetterId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)] // Only the low bits pick a stripe
        let index = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[index].lock().await
    }

    /// Record a failed event.
    ///
    /// A first failure creates the entry; later failures of the same event
    /// update it in place.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the entry cannot be persisted.
    #[tracing::instrument(skip(self, payload, failure), fields(event_id = ?failure.event_id, kind = failure.kind.as_str()))]
    pub async fn record_failure(
        &self,
        payload: Vec<u8>,
        failure: &IngestFailure,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let id = DeadLetterId::for_payload(&payload);
        let _guard = self.lock(&id).await;
        let now = self.clock.now();

        let mut entry = match self.store.get(&id).await? {
            Some(mut existing) => {
                existing.last_failed_at = now;
                existing.error_message.clone_from(&failure.message);
                existing.failure = failure.kind;
                if existing.status.is_terminal() {
                    // The broker delivered an event that was already closed out.
                    existing.status = DeadLetterStatus::Pending;
                    existing.resolved_at = None;
                    existing.next_attempt_at = None;
                }
                existing
            },
            None => DeadLetterEntry::new(payload, failure.kind, failure.message.clone(), now),
        };

        let escalate = entry.status == DeadLetterStatus::Escalated
            || !failure.kind.is_retryable()
            || entry.attempts >= self.policy.max_retries;

        if escalate {
            let newly = entry.status != DeadLetterStatus::Escalated;
            entry.status = DeadLetterStatus::Escalated;
            entry.next_attempt_at = None;
            self.store.upsert(entry.clone()).await?;
            if newly {
                self.escalated(&entry).await;
            }
        } else {
            if entry.next_attempt_at.is_none() {
                entry.next_attempt_at =
                    Some(now + chrono_duration(self.policy.delay_for_attempt(entry.attempts)));
            }
            self.store.upsert(entry.clone()).await?;
            tracing::warn!(
                id = %entry.id,
                next_attempt_at = ?entry.next_attempt_at,
                "Event dead-lettered for retry"
            );
            DeadLetterMetrics::record_transition(DeadLetterStatus::Pending);
        }

        self.refresh_pending_gauge().await;
        Ok(entry)
    }

    /// Redeliver every entry whose retry is due.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if due entries cannot be read or
    /// an outcome cannot be persisted.
    pub async fn sweep(&self, redeliver: &dyn Redeliver) -> Result<SweepReport, DeadLetterError> {
        let now = self.clock.now();
        let due = self.store.due(now, self.sweep_batch).await?;
        let mut report = SweepReport::default();

        for candidate in due {
            let _guard = self.lock(&candidate.id).await;
            // Re-read under the lock; a replay or discard may have got there first.
            let Some(mut entry) = self.store.get(&candidate.id).await? else {
                continue;
            };
            if !entry.is_due(now) {
                continue;
            }

            entry.attempts += 1;
            match redeliver.redeliver(&entry.payload).await {
                Ok(()) => {
                    entry.status = DeadLetterStatus::Resolved;
                    entry.resolved_at = Some(self.clock.now());
                    entry.next_attempt_at = None;
                    entry.resolution_notes =
                        Some(format!("applied on automatic retry {}", entry.attempts));
                    self.store.upsert(entry.clone()).await?;
                    tracing::info!(id = %entry.id, attempts = entry.attempts, "Dead-lettered event resolved");
                    DeadLetterMetrics::record_transition(DeadLetterStatus::Resolved);
                    report.resolved += 1;
                },
                Err(failure) => {
                    let failed_at = self.clock.now();
                    entry.last_failed_at = failed_at;
                    entry.error_message = failure.message;
                    entry.failure = failure.kind;

                    if !failure.kind.is_retryable() || entry.attempts >= self.policy.max_retries {
                        entry.status = DeadLetterStatus::Escalated;
                        entry.next_attempt_at = None;
                        self.store.upsert(entry.clone()).await?;
                        self.escalated(&entry).await;
                        report.escalated += 1;
                    } else {
                        entry.next_attempt_at = Some(
                            failed_at
                                + chrono_duration(self.policy.delay_for_attempt(entry.attempts)),
                        );
                        self.store.upsert(entry.clone()).await?;
                        tracing::warn!(
                            id = %entry.id,
                            attempts = entry.attempts,
                            next_attempt_at = ?entry.next_attempt_at,
                            "Dead-letter retry failed, rescheduled"
                        );
                        report.rescheduled += 1;
                    }
                },
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                resolved = report.resolved,
                rescheduled = report.rescheduled,
                escalated = report.escalated,
                "Dead-letter sweep finished"
            );
        }
        self.refresh_pending_gauge().await;
        Ok(report)
    }

    /// Re-submit one entry, optionally with a corrected payload.
    ///
    /// The entry is resolved if the payload applies; otherwise it is left
    /// escalated with the new failure recorded.
    ///
    /// # Errors
    ///
    /// - [`DeadLetterError::NotFound`] if there is no such entry
    /// - [`DeadLetterError::InvalidState`] if it is already resolved or discarded
    /// - [`DeadLetterError::Storage`] on backend failure
    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn replay(
        &self,
        id: &DeadLetterId,
        corrected_payload: Option<Vec<u8>>,
        redeliver: &dyn Redeliver,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let _guard = self.lock(id).await;
        let mut entry = self.open_entry(id).await?;

        let corrected = corrected_payload.is_some();
        if let Some(payload) = corrected_payload {
            entry.payload = payload;
        }

        let now = self.clock.now();
        match redeliver.redeliver(&entry.payload).await {
            Ok(()) => {
                entry.status = DeadLetterStatus::Resolved;
                entry.resolved_at = Some(now);
                entry.next_attempt_at = None;
                entry.resolution_notes = Some(if corrected {
                    "replayed with corrected payload".to_string()
                } else {
                    "replayed".to_string()
                });
                tracing::info!("Dead-lettered event replayed");
                DeadLetterMetrics::record_transition(DeadLetterStatus::Resolved);
            },
            Err(failure) => {
                tracing::warn!(error = %failure, "Replay failed");
                entry.last_failed_at = now;
                entry.error_message = failure.message;
                entry.failure = failure.kind;
                entry.next_attempt_at = None;
                entry.status = DeadLetterStatus::Escalated;
            },
        }

        self.store.upsert(entry.clone()).await?;
        self.refresh_pending_gauge().await;
        Ok(entry)
    }

    /// Close an entry without applying it.
    ///
    /// # Errors
    ///
    /// - [`DeadLetterError::NotFound`] if there is no such entry
    /// - [`DeadLetterError::InvalidState`] if it is already resolved or discarded
    /// - [`DeadLetterError::Storage`] on backend failure
    pub async fn discard(
        &self,
        id: &DeadLetterId,
        reason: impl Into<String>,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let _guard = self.lock(id).await;
        let mut entry = self.open_entry(id).await?;

        entry.status = DeadLetterStatus::Discarded;
        entry.resolved_at = Some(self.clock.now());
        entry.next_attempt_at = None;
        entry.resolution_notes = Some(reason.into());
        self.store.upsert(entry.clone()).await?;

        tracing::info!(id = %entry.id, "Dead-lettered event discarded");
        DeadLetterMetrics::record_transition(DeadLetterStatus::Discarded);
        self.refresh_pending_gauge().await;
        Ok(entry)
    }

    /// Fetch one entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] on backend failure.
    pub async fn get(&self, id: &DeadLetterId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        self.store.get(id).await
    }

    /// List entries, optionally by status.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] on backend failure.
    pub async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.store.list(status, limit).await
    }

    /// Number of entries in `status`.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] on backend failure.
    pub async fn count(&self, status: DeadLetterStatus) -> Result<usize, DeadLetterError> {
        self.store.count(status).await
    }

    async fn open_entry(&self, id: &DeadLetterId) -> Result<DeadLetterEntry, DeadLetterError> {
        let entry = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| DeadLetterError::NotFound(id.to_string()))?;
        if entry.status.is_terminal() {
            return Err(DeadLetterError::InvalidState {
                id: id.to_string(),
                status: entry.status,
            });
        }
        Ok(entry)
    }

    async fn escalated(&self, entry: &DeadLetterEntry) {
        tracing::error!(
            id = %entry.id,
            attempts = entry.attempts,
            failure = entry.failure.as_str(),
            error = %entry.error_message,
            "Dead-lettered event escalated for manual resolution"
        );
        DeadLetterMetrics::record_transition(DeadLetterStatus::Escalated);

        let message = match entry.failure {
            FailureKind::Validation => format!("Event rejected as invalid: {}", entry.error_message),
            FailureKind::Transient | FailureKind::Timeout => format!(
                "Event failed after {} redeliveries: {}",
                entry.attempts, entry.error_message
            ),
        };
        let alert = AuditRecord::Alert {
            severity: AlertSeverity::High,
            subject: entry.id.to_string(),
            message,
            at: self.clock.now(),
        };
        if let Err(e) = self.audit.record(alert).await {
            tracing::warn!(error = %e, "Failed to raise dead-letter alert");
        }
    }

    async fn refresh_pending_gauge(&self) {
        if let Ok(count) = self.store.count(DeadLetterStatus::Pending).await {
            DeadLetterMetrics::record_pending(count);
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` until shutdown.
    #[must_use]
    pub fn spawn_sweeper(
        self: Arc<Self>,
        redeliver: Arc<dyn Redeliver>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        spawn_periodic("dead-letter-sweeper", interval, shutdown, move || {
            let manager = Arc::clone(&self);
            let redeliver = Arc::clone(&redeliver);
            async move {
                if let Err(e) = manager.sweep(redeliver.as_ref()).await {
                    tracing::error!(error = %e, "Dead-letter sweep failed");
                }
            }
        })
    }
}
