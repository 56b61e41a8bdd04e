//! Prometheus metrics for the sync engine.
//!
//! Components record through the small recorder types below; the service
//! binary installs the exporter once with [`MetricsServer::start`] and serves
//! [`MetricsServer::render`] on `/metrics`.
//!
//! # Example
//!
//! ```rust,no_run
//! use inventory_sync_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! let _text = server.render();
//! # Ok(())
//! # }
//! ```

use inventory_sync_core::audit::{DiscrepancyResolution, EventOutcome};
use inventory_sync_core::dead_letter::DeadLetterStatus;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder plus the address it should be served on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the `/metrics` endpoint binds to.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register descriptions and install the global recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed (as happens across tests) is not
    /// an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("latency_seconds".to_string()),
                &[
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "inventory_events_total",
        "Inbound events by terminal outcome"
    );
    describe_histogram!(
        "inventory_event_latency_seconds",
        "Time from receipt to terminal outcome"
    );
    describe_counter!(
        "inventory_clamp_anomalies_total",
        "Decrements clamped at zero"
    );
    describe_counter!(
        "inventory_reservations_total",
        "Reservation requests by outcome"
    );
    describe_counter!(
        "inventory_dead_letter_total",
        "Dead-letter transitions by resulting status"
    );
    describe_gauge!(
        "inventory_dead_letter_pending",
        "Dead-letter entries awaiting automatic retry"
    );
    describe_counter!(
        "inventory_reconciliation_discrepancies_total",
        "Reconciliation discrepancies by resolution"
    );
    describe_counter!(
        "inventory_reconciliation_cycles_total",
        "Reconciliation cycles by result"
    );
    describe_gauge!(
        "inventory_idempotency_ledger_size",
        "Event IDs held by the idempotency ledger"
    );
}

#[allow(clippy::cast_precision_loss)] // Gauge values
fn as_gauge(n: usize) -> f64 {
    n as f64
}

/// Ingestion metrics recorder.
pub struct IngestMetrics;

impl IngestMetrics {
    /// Record a terminal event outcome.
    pub fn record_outcome(outcome: EventOutcome, latency: Duration) {
        counter!("inventory_events_total", "outcome" => outcome.as_str()).increment(1);
        histogram!("inventory_event_latency_seconds").record(latency.as_secs_f64());
    }

    /// Record a clamped decrement.
    pub fn record_clamp(field: &'static str) {
        counter!("inventory_clamp_anomalies_total", "field" => field).increment(1);
    }
}

/// Reservation metrics recorder.
pub struct ReservationMetrics;

impl ReservationMetrics {
    /// Record a reservation decision.
    pub fn record(outcome: &'static str) {
        counter!("inventory_reservations_total", "outcome" => outcome).increment(1);
    }
}

/// Dead-letter metrics recorder.
pub struct DeadLetterMetrics;

impl DeadLetterMetrics {
    /// Record a transition into `status`.
    pub fn record_transition(status: DeadLetterStatus) {
        counter!("inventory_dead_letter_total", "status" => status.as_str()).increment(1);
    }

    /// Record the number of pending entries.
    pub fn record_pending(count: usize) {
        gauge!("inventory_dead_letter_pending").set(as_gauge(count));
    }
}

/// Reconciliation metrics recorder.
pub struct ReconciliationMetrics;

impl ReconciliationMetrics {
    /// Record a handled discrepancy.
    pub fn record_discrepancy(resolution: DiscrepancyResolution) {
        counter!(
            "inventory_reconciliation_discrepancies_total",
            "resolution" => resolution.as_str()
        )
        .increment(1);
    }

    /// Record a cycle result (`completed` or `skipped`).
    pub fn record_cycle(result: &'static str) {
        counter!("inventory_reconciliation_cycles_total", "result" => result).increment(1);
    }
}

/// Idempotency ledger metrics recorder.
pub struct LedgerMetrics;

impl LedgerMetrics {
    /// Record the number of retained event IDs.
    pub fn record_size(size: usize) {
        gauge!("inventory_idempotency_ledger_size").set(as_gauge(size));
    }
}
