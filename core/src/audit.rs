//! Structured audit records and the sink that receives them.
//!
//! The engine emits one [`AuditRecord::EventProcessed`] per terminal event
//! outcome and one [`AuditRecord::Discrepancy`] per reconciliation finding.
//! High-priority alerts travel through the same sink as
//! [`AuditRecord::Alert`]. Where the records end up is the sink's business.

use crate::position::PositionKey;
use crate::reconciliation::ReconciliationDiscrepancy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Failure to deliver an audit record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    /// The sink rejected or could not reach its destination.
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Terminal outcome of one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// Quantities changed
    Applied,
    /// Event ID already recorded; nothing changed
    Deduplicated,
    /// Handed to the dead-letter path
    Failed,
}

impl EventOutcome {
    /// Label value for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Deduplicated => "deduplicated",
            Self::Failed => "failed",
        }
    }
}

/// How a reconciliation discrepancy was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyResolution {
    /// Within threshold; a correcting adjustment was applied
    AutoCorrected,
    /// Beyond threshold; left untouched for an operator
    ManualReview,
    /// Within threshold, but the correction could not be applied this cycle
    CorrectionFailed,
}

impl DiscrepancyResolution {
    /// Label value for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AutoCorrected => "auto_corrected",
            Self::ManualReview => "manual_review",
            Self::CorrectionFailed => "correction_failed",
        }
    }
}

/// Alert priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Worth a look
    Warning,
    /// Needs an operator
    High,
}

/// One structured audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    /// Terminal outcome of an inbound event
    EventProcessed {
        /// Event ID, when the payload carried one
        event_id: Option<String>,
        /// Position key, when the payload carried one
        key: Option<PositionKey>,
        /// What happened
        outcome: EventOutcome,
        /// Time from receipt to outcome
        #[serde(with = "latency_millis")]
        latency: Duration,
        /// Failure message, for failed outcomes
        detail: Option<String>,
        /// When the outcome was reached
        at: DateTime<Utc>,
    },
    /// A reconciliation finding
    Discrepancy {
        /// The finding
        discrepancy: ReconciliationDiscrepancy,
        /// How it was handled
        resolution: DiscrepancyResolution,
    },
    /// High-priority notification
    Alert {
        /// Priority
        severity: AlertSeverity,
        /// Short subject, e.g. the dead-letter ID or position key
        subject: String,
        /// Human-readable message
        message: String,
        /// When the alert was raised
        at: DateTime<Utc>,
    },
}

mod latency_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Destination for audit records and alerts.
///
/// The engine treats sink failures as non-fatal: they are logged and the
/// record is dropped.
pub trait AuditSink: Send + Sync {
    /// Deliver one record.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] if the record could not be delivered.
    fn record(
        &self,
        record: AuditRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), AuditError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn records_are_tagged_by_kind() {
        let record = AuditRecord::EventProcessed {
            event_id: Some("E1".into()),
            key: Some(PositionKey::new("store-1", "sku-1")),
            outcome: EventOutcome::Applied,
            latency: Duration::from_millis(12),
            detail: None,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "event_processed");
        assert_eq!(json["outcome"], "applied");
        assert_eq!(json["latency"], 12);
        assert_eq!(json["key"]["locationId"], "store-1");
    }
}
