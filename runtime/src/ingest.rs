//! Per-event ingestion: decode, validate, apply, audit, dead-letter.
//!
//! ```text
//! RECEIVED ─┬─> DEDUPLICATED            (ack)
//!           └─> APPLYING ─┬─> APPLIED   (ack)
//!                         └─> FAILED    (dead-letter, then ack)
//! ```
//!
//! Validation failures go straight to the dead-letter path. Transient store
//! failures and timeouts are retried a few times in-process first. If the
//! dead-letter store itself cannot record the failure, the delivery is left
//! unacknowledged so the broker redelivers it.

use crate::dead_letter::{DeadLetterManager, Redeliver};
use crate::metrics::IngestMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use inventory_sync_core::audit::{AuditRecord, AuditSink, EventOutcome};
use inventory_sync_core::dead_letter::{DeadLetterError, DeadLetterId, DeadLetterStatus, FailureKind};
use inventory_sync_core::environment::Clock;
use inventory_sync_core::event::{InventoryChangeEvent, RawInventoryEvent, ValidationError};
use inventory_sync_core::position::{ClampAnomaly, InventoryPosition, PositionKey};
use inventory_sync_core::store::{ApplyOutcome, EventApplier, StoreError};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why an event could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestFailure {
    /// Classification
    pub kind: FailureKind,
    /// Human-readable cause
    pub message: String,
    /// Event ID, if the payload carried one
    pub event_id: Option<String>,
    /// Position key, if the payload carried one
    pub key: Option<PositionKey>,
}

impl fmt::Display for IngestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind.as_str(), self.message)
    }
}

/// Terminal result of ingesting one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Quantities changed.
    Applied {
        /// Position after the event
        position: InventoryPosition,
        /// Set when a decrement was clamped
        anomaly: Option<ClampAnomaly>,
    },
    /// Already applied earlier.
    Deduplicated {
        /// The unchanged position
        position: InventoryPosition,
    },
    /// Handed to the dead-letter store.
    DeadLettered {
        /// Entry ID
        id: DeadLetterId,
        /// Status the entry was left in
        status: DeadLetterStatus,
    },
    /// The dead-letter store could not take the failure either.
    Unrecorded {
        /// The original failure
        failure: IngestFailure,
        /// Why the dead-letter store refused
        error: DeadLetterError,
    },
}

impl IngestOutcome {
    /// Whether the delivery should be acknowledged to the broker.
    #[must_use]
    pub const fn should_ack(&self) -> bool {
        !matches!(self, Self::Unrecorded { .. })
    }
}

enum AttemptError {
    Store(StoreError),
    TimedOut(Duration),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => e.fmt(f),
            Self::TimedOut(after) => write!(f, "processing timed out after {after:?}"),
        }
    }
}

/// Runs one payload through validation and the position store.
pub struct IngestPipeline {
    applier: Arc<dyn EventApplier>,
    dead_letters: Arc<DeadLetterManager>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    event_timeout: Duration,
}

impl IngestPipeline {
    /// Create a pipeline.
    #[must_use]
    pub fn new(
        applier: Arc<dyn EventApplier>,
        dead_letters: Arc<DeadLetterManager>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        event_timeout: Duration,
    ) -> Self {
        Self {
            applier,
            dead_letters,
            audit,
            clock,
            retry,
            event_timeout,
        }
    }

    /// The dead-letter manager failures are routed to.
    #[must_use]
    pub fn dead_letters(&self) -> &Arc<DeadLetterManager> {
        &self.dead_letters
    }

    /// Ingest one payload from the broker, dead-lettering on failure.
    #[tracing::instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn ingest(&self, payload: &[u8]) -> IngestOutcome {
        let failure = match self.process(payload).await {
            Ok(ApplyOutcome::Applied { position, anomaly }) => {
                return IngestOutcome::Applied { position, anomaly };
            },
            Ok(ApplyOutcome::Duplicate { position }) => {
                return IngestOutcome::Deduplicated { position };
            },
            Err(failure) => failure,
        };

        match self
            .dead_letters
            .record_failure(payload.to_vec(), &failure)
            .await
        {
            Ok(entry) => IngestOutcome::DeadLettered {
                id: entry.id,
                status: entry.status,
            },
            Err(error) => {
                tracing::error!(
                    event_id = ?failure.event_id,
                    error = %error,
                    "Failed to dead-letter event, leaving delivery unacknowledged"
                );
                IngestOutcome::Unrecorded { failure, error }
            },
        }
    }

    /// Encode an internally generated event and ingest it like any other.
    pub async fn submit(&self, event: &InventoryChangeEvent) -> IngestOutcome {
        match event.to_json() {
            Ok(payload) => self.ingest(&payload).await,
            Err(e) => IngestOutcome::Unrecorded {
                failure: IngestFailure {
                    kind: FailureKind::Validation,
                    message: e.to_string(),
                    event_id: Some(event.event_id.to_string()),
                    key: Some(event.key.clone()),
                },
                error: DeadLetterError::Storage("event could not be encoded".to_string()),
            },
        }
    }

    /// Decode, validate and apply one payload without touching the dead-letter store.
    ///
    /// Emits exactly one audit record for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`IngestFailure`] if the payload is invalid or could not be
    /// applied within the local retry budget.
    pub async fn process(&self, payload: &[u8]) -> Result<ApplyOutcome, IngestFailure> {
        let started = Instant::now();

        let raw = match RawInventoryEvent::from_json(payload) {
            Ok(raw) => raw,
            Err(e) => {
                let failure = validation_failure(&e, None, None);
                self.finish(Err(&failure), None, None, started).await;
                return Err(failure);
            },
        };
        let event_id = raw.event_id.clone();
        let key = raw.key_hint();

        let event = match raw.validate() {
            Ok(event) => event,
            Err(e) => {
                let failure = validation_failure(&e, event_id.clone(), key.clone());
                self.finish(Err(&failure), event_id, key, started).await;
                return Err(failure);
            },
        };

        let result = retry_with_predicate(
            &self.retry,
            || self.attempt(&event),
            |err: &AttemptError| match err {
                AttemptError::Store(e) => e.is_transient(),
                AttemptError::TimedOut(_) => true,
            },
        )
        .await
        .map_err(|err| {
            let kind = match &err {
                AttemptError::Store(StoreError::Rejected(_)) => FailureKind::Validation,
                AttemptError::Store(_) => FailureKind::Transient,
                AttemptError::TimedOut(_) => FailureKind::Timeout,
            };
            IngestFailure {
                kind,
                message: err.to_string(),
                event_id: event_id.clone(),
                key: key.clone(),
            }
        });

        self.finish(result.as_ref(), event_id, key, started).await;
        result
    }

    async fn attempt(&self, event: &InventoryChangeEvent) -> Result<ApplyOutcome, AttemptError> {
        match tokio::time::timeout(self.event_timeout, self.applier.apply(event)).await {
            Ok(result) => result.map_err(AttemptError::Store),
            Err(_) => Err(AttemptError::TimedOut(self.event_timeout)),
        }
    }

    async fn finish(
        &self,
        result: Result<&ApplyOutcome, &IngestFailure>,
        event_id: Option<String>,
        key: Option<PositionKey>,
        started: Instant,
    ) {
        let latency = started.elapsed();
        let (outcome, detail) = match result {
            Ok(ApplyOutcome::Applied { .. }) => (EventOutcome::Applied, None),
            Ok(ApplyOutcome::Duplicate { .. }) => (EventOutcome::Deduplicated, None),
            Err(failure) => (EventOutcome::Failed, Some(failure.message.clone())),
        };

        match outcome {
            EventOutcome::Applied => {
                tracing::debug!(event_id = ?event_id, "Event applied");
            },
            EventOutcome::Deduplicated => {
                tracing::debug!(event_id = ?event_id, "Duplicate event skipped");
            },
            EventOutcome::Failed => {
                tracing::warn!(event_id = ?event_id, error = ?detail, "Event failed");
            },
        }
        IngestMetrics::record_outcome(outcome, latency);

        let record = AuditRecord::EventProcessed {
            event_id,
            key,
            outcome,
            latency,
            detail,
            at: self.clock.now(),
        };
        if let Err(e) = self.audit.record(record).await {
            tracing::warn!(error = %e, "Failed to write audit record");
        }
    }
}

fn validation_failure(
    error: &ValidationError,
    event_id: Option<String>,
    key: Option<PositionKey>,
) -> IngestFailure {
    IngestFailure {
        kind: FailureKind::Validation,
        message: error.to_string(),
        event_id,
        key,
    }
}

impl Redeliver for IngestPipeline {
    fn redeliver<'a>(
        &'a self,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), IngestFailure>> + Send + 'a>> {
        Box::pin(async move { self.process(payload).await.map(|_| ()) })
    }
}
