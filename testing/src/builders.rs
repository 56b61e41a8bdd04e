//! Event builders for tests.
//!
//! The typed builders panic on inputs that break the sign conventions; they
//! are meant for fixtures, not for exercising validation. Use [`raw`] to build
//! deliberately broken envelopes.

use chrono::{DateTime, Utc};
use inventory_sync_core::event::{EventType, InventoryChangeEvent, RawInventoryEvent};
use inventory_sync_core::position::PositionKey;

fn fixed_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

/// Build a validated event.
///
/// # Panics
///
/// Panics if the delta does not fit the event type.
#[must_use]
#[allow(clippy::expect_used)]
pub fn event(id: &str, event_type: EventType, key: &PositionKey, quantity_delta: i64) -> InventoryChangeEvent {
    InventoryChangeEvent::new(id, event_type, key.clone(), quantity_delta, "test", fixed_time(), id)
        .expect("fixture event should satisfy the sign conventions")
}

/// A `SALE` of `qty` units.
#[must_use]
pub fn sale(id: &str, key: &PositionKey, qty: u32) -> InventoryChangeEvent {
    event(id, EventType::Sale, key, -i64::from(qty))
}

/// A `RECEIPT` of `qty` units.
#[must_use]
pub fn receipt(id: &str, key: &PositionKey, qty: u32) -> InventoryChangeEvent {
    event(id, EventType::Receipt, key, i64::from(qty))
}

/// An `ADJUSTMENT` setting on hand to `target`.
#[must_use]
pub fn adjustment(id: &str, key: &PositionKey, target: u32) -> InventoryChangeEvent {
    event(id, EventType::Adjustment, key, i64::from(target))
}

/// A `RESERVE` of `qty` units.
#[must_use]
pub fn reserve(id: &str, key: &PositionKey, qty: u32) -> InventoryChangeEvent {
    event(id, EventType::Reserve, key, i64::from(qty))
}

/// A complete raw envelope, ready to have fields knocked out.
#[must_use]
pub fn raw(id: &str, event_type: &str, key: &PositionKey, quantity_delta: i64) -> RawInventoryEvent {
    RawInventoryEvent {
        event_id: Some(id.to_string()),
        event_type: Some(event_type.to_string()),
        location_id: Some(key.location_id.clone()),
        item_id: Some(key.item_id.clone()),
        quantity_delta: Some(quantity_delta),
        source_system: Some("test".to_string()),
        event_time: Some(fixed_time()),
        correlation_id: Some(id.to_string()),
    }
}

/// Encode an event as its JSON envelope.
///
/// # Panics
///
/// Panics if encoding fails, which JSON encoding of these types never does.
#[must_use]
#[allow(clippy::expect_used)]
pub fn payload(event: &InventoryChangeEvent) -> Vec<u8> {
    event.to_json().expect("events always encode")
}

/// Encode a raw envelope as JSON.
///
/// # Panics
///
/// Panics if encoding fails, which JSON encoding of these types never does.
#[must_use]
#[allow(clippy::expect_used)]
pub fn raw_payload(raw: &RawInventoryEvent) -> Vec<u8> {
    raw.to_json().expect("raw envelopes always encode")
}
