//! Available-to-promise and reservation gating.
//!
//! ```text
//! ATP = max(0, onHand - allocated - safetyStock + pendingReceiptsWithinHorizon)
//! ```
//!
//! Pending receipts come from a [`ReceiptSchedule`] and are capped at the
//! position's in-transit quantity, so the schedule can never make more units
//! promisable than are actually en route. A schedule that cannot be read
//! counts as zero.
//!
//! Reservations re-check ATP inside the store's per-key critical section
//! (see [`PositionStore::apply_guarded`]), so concurrent reservations for the
//! same key cannot oversell.

use crate::metrics::ReservationMetrics;
use crate::store::{Guarded, PositionStore};
use inventory_sync_core::environment::{Clock, chrono_duration};
use inventory_sync_core::event::{EventId, EventType, InventoryChangeEvent, ValidationError};
use inventory_sync_core::policy::ReceiptSchedule;
use inventory_sync_core::position::{InventoryPosition, PositionKey};
use inventory_sync_core::store::{ApplyOutcome, StoreError};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const SOURCE_SYSTEM: &str = "availability";

/// Ledger ID for a caller request, kept apart from bus event IDs.
fn request_event_id(kind: &str, request_id: &EventId) -> EventId {
    EventId::new(format!("{kind}:{request_id}"))
}

/// ATP for a position given the receipts expected within the horizon.
///
/// Never negative.
///
/// # Examples
///
/// ```
/// use inventory_sync_core::position::{InventoryPosition, PositionKey};
/// use inventory_sync_runtime::availability::available_to_promise;
///
/// let position = InventoryPosition {
///     on_hand_qty: 100,
///     allocated_qty: 85,
///     safety_stock_qty: 10,
///     ..InventoryPosition::empty(&PositionKey::new("store-1", "sku-1"))
/// };
/// assert_eq!(available_to_promise(&position, 0), 5);
///
/// let short = InventoryPosition { allocated_qty: 99, ..position };
/// assert_eq!(available_to_promise(&short, 0), 0);
/// ```
#[must_use]
pub fn available_to_promise(position: &InventoryPosition, pending_receipts: u64) -> u64 {
    let pending = pending_receipts.min(position.in_transit_qty);
    let atp = i128::from(position.on_hand_qty) - i128::from(position.allocated_qty)
        - i128::from(position.safety_stock_qty)
        + i128::from(pending);
    u64::try_from(atp.max(0)).unwrap_or(u64::MAX)
}

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Not enough ATP at the moment of the check
    InsufficientAvailability {
        /// Units asked for
        requested: u64,
        /// ATP at the moment of the check
        available: u64,
    },
    /// The allocation would exceed on hand plus in transit
    ExceedsSupply {
        /// Units asked for
        requested: u64,
        /// On hand plus in transit
        supply: u64,
    },
    /// Zero or unrepresentably large quantity
    InvalidQuantity {
        /// Units asked for
        requested: u64,
    },
    /// The reservation ID was already used for a different request
    ConflictingRequestId {
        /// Units asked for
        requested: u64,
    },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientAvailability { .. } | Self::ExceedsSupply { .. } => {
                f.write_str("insufficient availability")
            },
            Self::InvalidQuantity { .. } => f.write_str("invalid quantity"),
            Self::ConflictingRequestId { .. } => f.write_str("reservation ID already used"),
        }
    }
}

/// Result of a reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    /// Units were allocated.
    Accepted {
        /// Caller-facing ID of the reservation
        reservation_id: EventId,
        /// Position after the allocation
        position: InventoryPosition,
    },
    /// Nothing was allocated.
    Rejected {
        /// Why
        reason: RejectionReason,
        /// Position at the moment of the check
        position: InventoryPosition,
    },
}

impl ReservationOutcome {
    /// Whether the reservation was accepted.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Acknowledgement of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAck {
    /// Position after the release
    pub position: InventoryPosition,
    /// True when more was released than was allocated
    pub clamped: bool,
}

/// Computes ATP and executes reservations against the position store.
pub struct AvailabilityCalculator {
    store: Arc<PositionStore>,
    receipts: Arc<dyn ReceiptSchedule>,
    clock: Arc<dyn Clock>,
    horizon: Duration,
}

impl AvailabilityCalculator {
    /// Create a calculator.
    #[must_use]
    pub fn new(
        store: Arc<PositionStore>,
        receipts: Arc<dyn ReceiptSchedule>,
        clock: Arc<dyn Clock>,
        horizon: Duration,
    ) -> Self {
        Self {
            store,
            receipts,
            clock,
            horizon,
        }
    }

    async fn pending_receipts(&self, key: &PositionKey) -> u64 {
        let horizon_end = self.clock.now() + chrono_duration(self.horizon);
        match self.receipts.pending_receipts(key, horizon_end).await {
            Ok(units) => units,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Receipt schedule unavailable, counting no pending receipts");
                0
            },
        }
    }

    /// Snapshot of one position.
    pub async fn position(&self, key: &PositionKey) -> InventoryPosition {
        self.store.get(key).await
    }

    /// Current ATP for `key`.
    pub async fn compute_atp(&self, key: &PositionKey) -> u64 {
        let pending = self.pending_receipts(key).await;
        let position = self.store.get(key).await;
        available_to_promise(&position, pending)
    }

    /// Reserve `qty` units under a fresh reservation ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only for store-level failures; insufficient
    /// availability is a [`ReservationOutcome::Rejected`].
    pub async fn reserve(
        &self,
        key: &PositionKey,
        qty: u64,
    ) -> Result<ReservationOutcome, StoreError> {
        self.reserve_with_id(EventId::generate(), key, qty).await
    }

    /// Reserve `qty` units under a caller-chosen reservation ID.
    ///
    /// Retrying with the same ID and quantity after an acceptance is a no-op
    /// that reports the acceptance again. Reusing the ID for a different
    /// quantity or position is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only for store-level failures.
    #[tracing::instrument(skip_all, fields(key = %key, qty = qty))]
    pub async fn reserve_with_id(
        &self,
        reservation_id: EventId,
        key: &PositionKey,
        qty: u64,
    ) -> Result<ReservationOutcome, StoreError> {
        let Some(delta) = i64::try_from(qty).ok().filter(|d| *d > 0) else {
            ReservationMetrics::record("invalid");
            return Ok(ReservationOutcome::Rejected {
                reason: RejectionReason::InvalidQuantity { requested: qty },
                position: self.store.get(key).await,
            });
        };

        let pending = self.pending_receipts(key).await;
        let event = InventoryChangeEvent::new(
            request_event_id("reserve", &reservation_id),
            EventType::Reserve,
            key.clone(),
            delta,
            SOURCE_SYSTEM,
            self.clock.now(),
            reservation_id.as_str(),
        )?;

        let guarded = self
            .store
            .apply_guarded(&event, |current, next| {
                let available = available_to_promise(current, pending);
                if qty > available {
                    return Err(RejectionReason::InsufficientAvailability {
                        requested: qty,
                        available,
                    });
                }
                if next.is_over_allocated() {
                    return Err(RejectionReason::ExceedsSupply {
                        requested: qty,
                        supply: next.supply_qty(),
                    });
                }
                Ok(())
            })
            .await?;

        match guarded {
            Guarded::Completed(ApplyOutcome::Duplicate { position }) if !self.repeats(&event) => {
                tracing::warn!(reservation_id = %reservation_id, "Reservation ID reused for a different request");
                ReservationMetrics::record("rejected");
                Ok(ReservationOutcome::Rejected {
                    reason: RejectionReason::ConflictingRequestId { requested: qty },
                    position,
                })
            },
            Guarded::Completed(ApplyOutcome::Applied { position, .. } | ApplyOutcome::Duplicate { position }) => {
                tracing::info!(qty, allocated = position.allocated_qty, "Reservation accepted");
                ReservationMetrics::record("accepted");
                Ok(ReservationOutcome::Accepted {
                    reservation_id,
                    position,
                })
            },
            Guarded::Refused { reason, position } => {
                tracing::info!(qty, reason = ?reason, "Reservation rejected");
                ReservationMetrics::record("rejected");
                Ok(ReservationOutcome::Rejected { reason, position })
            },
        }
    }

    /// Release `qty` allocated units.
    ///
    /// Releasing more than is allocated clamps at zero and still succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] for store-level failures.
    pub async fn release(&self, key: &PositionKey, qty: u64) -> Result<ReleaseAck, StoreError> {
        self.release_with_id(EventId::generate(), key, qty).await
    }

    /// Release under a caller-chosen ID.
    ///
    /// The ID lives in its own namespace, so it may equal the ID of the
    /// reservation being released. Repeating a release is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Rejected`] when the ID was already used for a
    /// different release, and [`StoreError`] for store-level failures.
    #[tracing::instrument(skip_all, fields(key = %key, qty = qty))]
    pub async fn release_with_id(
        &self,
        release_id: EventId,
        key: &PositionKey,
        qty: u64,
    ) -> Result<ReleaseAck, StoreError> {
        let delta = i64::try_from(qty).unwrap_or(i64::MAX);
        let event = InventoryChangeEvent::new(
            request_event_id("release", &release_id),
            EventType::Release,
            key.clone(),
            -delta,
            SOURCE_SYSTEM,
            self.clock.now(),
            release_id.as_str(),
        )?;

        let outcome = self.store.apply(&event).await?;
        if outcome.is_duplicate() && !self.repeats(&event) {
            return Err(StoreError::Rejected(ValidationError::ConflictingEventId(
                release_id,
            )));
        }
        let clamped = matches!(outcome, ApplyOutcome::Applied { anomaly: Some(_), .. });
        Ok(ReleaseAck {
            position: outcome.position().clone(),
            clamped,
        })
    }

    /// Whether the ledgered event under `event`'s ID made the same change.
    fn repeats(&self, event: &InventoryChangeEvent) -> bool {
        self.store
            .ledger()
            .get(&event.event_id)
            .is_some_and(|record| record.matches(event))
    }
}
