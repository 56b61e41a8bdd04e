//! The mutation seam in front of the position store.
//!
//! Ingestion, dead-letter replay and reconciliation corrections all reach
//! positions through [`EventApplier`]. There is no other write path.

use crate::event::{InventoryChangeEvent, ValidationError};
use crate::position::{ClampAnomaly, InventoryPosition};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from applying an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot currently accept writes.
    #[error("Position store unavailable: {0}")]
    Unavailable(String),

    /// The per-key critical section could not be entered in time.
    #[error("Timed out waiting for position {key}")]
    Timeout {
        /// `location/item`
        key: String,
    },

    /// The event does not fit the position rules.
    #[error("Event rejected: {0}")]
    Rejected(#[from] ValidationError),
}

impl StoreError {
    /// Whether retrying the same event may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// What happened when an event reached the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event changed the position.
    Applied {
        /// Position after the event
        position: InventoryPosition,
        /// Set when a decrement was clamped at zero
        anomaly: Option<ClampAnomaly>,
    },
    /// The event ID was already recorded; nothing changed.
    Duplicate {
        /// The current, unchanged position
        position: InventoryPosition,
    },
}

impl ApplyOutcome {
    /// The position after the call, whichever way it went.
    #[must_use]
    pub const fn position(&self) -> &InventoryPosition {
        match self {
            Self::Applied { position, .. } | Self::Duplicate { position } => position,
        }
    }

    /// Whether the event was a redelivery.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Applies validated events under per-key serialization.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so pipelines can hold an
/// `Arc<dyn EventApplier>`.
pub trait EventApplier: Send + Sync {
    /// Apply one event exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the event is rejected or the store is
    /// temporarily unable to apply it.
    fn apply<'a>(
        &'a self,
        event: &'a InventoryChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, StoreError>> + Send + 'a>>;
}
