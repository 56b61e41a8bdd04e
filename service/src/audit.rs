//! Audit sink that writes records to the log.
//!
//! Records go to the `inventory_sync::audit` target so they can be routed
//! separately with `RUST_LOG`.

use inventory_sync_core::audit::{AlertSeverity, AuditError, AuditRecord, AuditSink};
use std::future::Future;
use std::pin::Pin;

/// [`AuditSink`] backed by `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    fn emit(record: &AuditRecord) {
        match record {
            AuditRecord::EventProcessed {
                event_id,
                key,
                outcome,
                latency,
                detail,
                ..
            } => tracing::info!(
                target: "inventory_sync::audit",
                event_id = event_id.as_deref().unwrap_or("-"),
                key = %key.as_ref().map_or_else(|| "-".to_string(), ToString::to_string),
                outcome = outcome.as_str(),
                latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                detail = detail.as_deref().unwrap_or(""),
                "Event processed"
            ),
            AuditRecord::Discrepancy {
                discrepancy,
                resolution,
            } => tracing::warn!(
                target: "inventory_sync::audit",
                key = %discrepancy.key,
                local_qty = discrepancy.local_qty,
                source_qty = discrepancy.source_qty,
                delta = discrepancy.delta,
                resolution = resolution.as_str(),
                "Reconciliation discrepancy"
            ),
            AuditRecord::Alert {
                severity: AlertSeverity::High,
                subject,
                message,
                ..
            } => tracing::error!(
                target: "inventory_sync::audit",
                subject = %subject,
                alert = %message,
                "High-priority alert"
            ),
            AuditRecord::Alert {
                severity: AlertSeverity::Warning,
                subject,
                message,
                ..
            } => tracing::warn!(
                target: "inventory_sync::audit",
                subject = %subject,
                alert = %message,
                "Alert"
            ),
        }
    }
}

impl AuditSink for TracingAuditSink {
    fn record(
        &self,
        record: AuditRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), AuditError>> + Send + '_>> {
        Self::emit(&record);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn every_record_kind_is_accepted() {
        let sink = TracingAuditSink;
        for severity in [AlertSeverity::Warning, AlertSeverity::High] {
            let alert = AuditRecord::Alert {
                severity,
                subject: "E1".to_string(),
                message: "Event failed after 5 redeliveries".to_string(),
                at: Utc::now(),
            };
            sink.record(alert).await.unwrap();
        }
    }
}
