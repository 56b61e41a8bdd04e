//! Inventory positions and the quantity update rules.
//!
//! An [`InventoryPosition`] is a plain value. The rules that turn one position
//! into the next live here as pure functions so that the store only has to
//! worry about serialization and idempotency.

use crate::event::{InventoryChangeEvent, PositionEffect, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite identity of a position: one item at one location.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionKey {
    /// Location identifier
    pub location_id: String,
    /// Item identifier
    pub item_id: String,
}

impl PositionKey {
    /// Create a key.
    #[must_use]
    pub fn new(location_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            item_id: item_id.into(),
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.location_id, self.item_id)
    }
}

/// Current quantity state for one (location, item) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryPosition {
    /// Location identifier
    pub location_id: String,
    /// Item identifier
    pub item_id: String,
    /// Physically present units
    pub on_hand_qty: u64,
    /// Units reserved against future fulfillment
    pub allocated_qty: u64,
    /// Units en route, not yet on hand
    pub in_transit_qty: u64,
    /// Configured minimum buffer
    pub safety_stock_qty: u64,
    /// Most recently applied event, for ordering diagnostics
    pub last_applied_event_id: Option<String>,
    /// Last successful comparison against the source of record
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Last quantity mutation
    pub last_modified_time: Option<DateTime<Utc>>,
}

/// Which quantity a clamp hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityField {
    /// `onHandQty`
    OnHand,
    /// `allocatedQty`
    Allocated,
}

impl QuantityField {
    /// Field name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OnHand => "on_hand",
            Self::Allocated => "allocated",
        }
    }
}

/// A decrement that would have taken a quantity below zero.
///
/// The position is clamped at zero and the anomaly is reported; the event
/// itself still counts as applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClampAnomaly {
    /// The clamped field
    pub field: QuantityField,
    /// Units the event asked to remove
    pub requested: u64,
    /// Units that were actually there
    pub available: u64,
}

impl ClampAnomaly {
    /// Units that could not be removed.
    #[must_use]
    pub const fn shortfall(&self) -> u64 {
        self.requested.saturating_sub(self.available)
    }
}

/// The result of applying one event to a position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedChange {
    /// The next position
    pub position: InventoryPosition,
    /// Set when a decrement was clamped
    pub anomaly: Option<ClampAnomaly>,
}

impl InventoryPosition {
    /// A zero position for a never-seen key.
    #[must_use]
    pub fn empty(key: &PositionKey) -> Self {
        Self {
            location_id: key.location_id.clone(),
            item_id: key.item_id.clone(),
            on_hand_qty: 0,
            allocated_qty: 0,
            in_transit_qty: 0,
            safety_stock_qty: 0,
            last_applied_event_id: None,
            last_sync_time: None,
            last_modified_time: None,
        }
    }

    /// The composite key.
    #[must_use]
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.location_id.clone(), self.item_id.clone())
    }

    /// Units that can back an allocation: on hand plus in transit.
    #[must_use]
    pub const fn supply_qty(&self) -> u64 {
        self.on_hand_qty.saturating_add(self.in_transit_qty)
    }

    /// Whether allocations exceed supply.
    ///
    /// Allowed transiently (for example after a downward reconciliation), but
    /// never as the result of an accepted reservation.
    #[must_use]
    pub const fn is_over_allocated(&self) -> bool {
        self.allocated_qty > self.supply_qty()
    }

    /// Apply one event, returning the next position.
    ///
    /// - `SALE`/`TRANSFER_OUT` decrement on hand
    /// - `RECEIPT`/`TRANSFER_IN` increment on hand and drain the same number of
    ///   units from in transit, as far as they were counted there
    /// - `ADJUSTMENT` sets on hand
    /// - `RESERVE`/`RELEASE` move allocated
    ///
    /// Decrements below zero clamp and report a [`ClampAnomaly`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the event's change does not fit its type.
    pub fn apply(
        &self,
        event: &InventoryChangeEvent,
        at: DateTime<Utc>,
    ) -> Result<AppliedChange, ValidationError> {
        let mut next = self.clone();
        let mut anomaly = None;

        match event.effect()? {
            PositionEffect::DecreaseOnHand(units) => {
                let (qty, clamp) = clamped_sub(self.on_hand_qty, units, QuantityField::OnHand);
                next.on_hand_qty = qty;
                anomaly = clamp;
            },
            PositionEffect::IncreaseOnHand(units) => {
                next.on_hand_qty = self.on_hand_qty.saturating_add(units);
                next.in_transit_qty = self.in_transit_qty - units.min(self.in_transit_qty);
            },
            PositionEffect::SetOnHand(target) => {
                next.on_hand_qty = target;
            },
            PositionEffect::Allocate(units) => {
                next.allocated_qty = self.allocated_qty.saturating_add(units);
            },
            PositionEffect::Deallocate(units) => {
                let (qty, clamp) =
                    clamped_sub(self.allocated_qty, units, QuantityField::Allocated);
                next.allocated_qty = qty;
                anomaly = clamp;
            },
        }

        next.last_applied_event_id = Some(event.event_id.as_str().to_string());
        next.last_modified_time = Some(at);

        Ok(AppliedChange {
            position: next,
            anomaly,
        })
    }
}

fn clamped_sub(current: u64, units: u64, field: QuantityField) -> (u64, Option<ClampAnomaly>) {
    match current.checked_sub(units) {
        Some(qty) => (qty, None),
        None => (
            0,
            Some(ClampAnomaly {
                field,
                requested: units,
                available: current,
            }),
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::event::{EventType, InventoryChangeEvent};
    use proptest::prelude::*;

    fn key() -> PositionKey {
        PositionKey::new("store-1", "sku-1")
    }

    fn event(id: &str, event_type: EventType, delta: i64) -> InventoryChangeEvent {
        InventoryChangeEvent::new(id, event_type, key(), delta, "test", Utc::now(), id)
            .expect("valid test event")
    }

    fn position(on_hand: u64, allocated: u64, in_transit: u64) -> InventoryPosition {
        InventoryPosition {
            on_hand_qty: on_hand,
            allocated_qty: allocated,
            in_transit_qty: in_transit,
            ..InventoryPosition::empty(&key())
        }
    }

    #[test]
    fn sale_decrements_on_hand() {
        let applied = position(100, 0, 0)
            .apply(&event("E1", EventType::Sale, -20), Utc::now())
            .unwrap();
        assert_eq!(applied.position.on_hand_qty, 80);
        assert_eq!(applied.position.last_applied_event_id.as_deref(), Some("E1"));
        assert!(applied.anomaly.is_none());
    }

    #[test]
    fn oversized_sale_clamps_and_reports() {
        let applied = position(5, 0, 0)
            .apply(&event("E1", EventType::TransferOut, -8), Utc::now())
            .unwrap();
        assert_eq!(applied.position.on_hand_qty, 0);
        let anomaly = applied.anomaly.expect("clamp recorded");
        assert_eq!(anomaly.field, QuantityField::OnHand);
        assert_eq!(anomaly.shortfall(), 3);
    }

    #[test]
    fn receipt_drains_in_transit_only_as_far_as_counted() {
        let applied = position(10, 0, 4)
            .apply(&event("E1", EventType::Receipt, 6), Utc::now())
            .unwrap();
        assert_eq!(applied.position.on_hand_qty, 16);
        assert_eq!(applied.position.in_transit_qty, 0);

        let applied = position(10, 0, 9)
            .apply(&event("E2", EventType::TransferIn, 6), Utc::now())
            .unwrap();
        assert_eq!(applied.position.in_transit_qty, 3);
    }

    #[test]
    fn adjustment_sets_on_hand() {
        let applied = position(50, 3, 0)
            .apply(&event("E1", EventType::Adjustment, 45), Utc::now())
            .unwrap();
        assert_eq!(applied.position.on_hand_qty, 45);
        assert_eq!(applied.position.allocated_qty, 3);
    }

    #[test]
    fn release_beyond_allocation_clamps() {
        let applied = position(10, 2, 0)
            .apply(&event("E1", EventType::Release, -5), Utc::now())
            .unwrap();
        assert_eq!(applied.position.allocated_qty, 0);
        assert_eq!(
            applied.anomaly.map(|a| a.field),
            Some(QuantityField::Allocated)
        );
    }

    fn any_event() -> impl Strategy<Value = InventoryChangeEvent> {
        (0usize..EventType::ALL.len(), 0i64..500).prop_map(|(i, magnitude)| {
            let event_type = EventType::ALL[i];
            let delta = match event_type {
                EventType::Sale | EventType::TransferOut | EventType::Release => -magnitude,
                _ => magnitude,
            };
            event(&format!("E{i}-{magnitude}"), event_type, delta)
        })
    }

    proptest! {
        #[test]
        fn in_transit_never_grows_from_events(
            on_hand in 0u64..1000,
            allocated in 0u64..1000,
            in_transit in 0u64..1000,
            events in proptest::collection::vec(any_event(), 0..40),
        ) {
            let mut current = position(on_hand, allocated, in_transit);
            for e in &events {
                let applied = current.apply(e, Utc::now()).unwrap();
                prop_assert!(applied.position.in_transit_qty <= current.in_transit_qty);
                current = applied.position;
            }
        }
    }
}
