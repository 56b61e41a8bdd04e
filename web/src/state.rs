//! Application state for Axum handlers.

use inventory_sync_runtime::{AvailabilityCalculator, DeadLetterManager, Redeliver, SyncEngine};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Engine handles shared across all HTTP handlers.
///
/// Cloning is cheap; every field is reference counted.
#[derive(Clone)]
pub struct AppState {
    /// Position reads, ATP and reservations
    pub availability: Arc<AvailabilityCalculator>,
    /// Dead-letter inspection and operator actions
    pub dead_letters: Arc<DeadLetterManager>,
    /// Path used to replay dead-lettered payloads
    pub redeliver: Arc<dyn Redeliver>,
    ready: Arc<AtomicBool>,
}

impl AppState {
    /// Create state from explicit handles. Starts not ready.
    #[must_use]
    pub fn new(
        availability: Arc<AvailabilityCalculator>,
        dead_letters: Arc<DeadLetterManager>,
        redeliver: Arc<dyn Redeliver>,
    ) -> Self {
        Self {
            availability,
            dead_letters,
            redeliver,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create state over an assembled engine. Replays go through its pipeline.
    #[must_use]
    pub fn from_engine(engine: &SyncEngine) -> Self {
        Self::new(
            Arc::clone(engine.availability()),
            Arc::clone(engine.dead_letters()),
            Arc::clone(engine.pipeline()) as Arc<dyn Redeliver>,
        )
    }

    /// Mark the service ready (or not) to take traffic.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Whether the service has finished starting up.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
