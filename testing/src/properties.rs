//! Proptest strategies for events and positions.

use crate::builders;
use inventory_sync_core::event::{EventType, InventoryChangeEvent};
use inventory_sync_core::position::PositionKey;
use proptest::prelude::*;

/// Any event type.
pub fn arb_event_type() -> impl Strategy<Value = EventType> {
    proptest::sample::select(EventType::ALL.to_vec())
}

/// A quantity delta that satisfies the sign convention of `event_type`.
pub fn arb_delta_for(event_type: EventType) -> BoxedStrategy<i64> {
    match event_type {
        EventType::Sale | EventType::TransferOut | EventType::Release => {
            (-500i64..=0).boxed()
        },
        EventType::Receipt | EventType::TransferIn | EventType::Reserve | EventType::Adjustment => {
            (0i64..=500).boxed()
        },
    }
}

/// A valid event for `key` with the given ID.
pub fn arb_event(id: String, key: PositionKey) -> impl Strategy<Value = InventoryChangeEvent> {
    arb_event_type()
        .prop_flat_map(|event_type| (Just(event_type), arb_delta_for(event_type)))
        .prop_map(move |(event_type, delta)| builders::event(&id, event_type, &key, delta))
}

/// A sequence of valid events for `key` with IDs `{prefix}-0`, `{prefix}-1`, ...
pub fn arb_event_sequence(
    prefix: &'static str,
    key: PositionKey,
    max_len: usize,
) -> impl Strategy<Value = Vec<InventoryChangeEvent>> {
    proptest::collection::vec(
        arb_event_type().prop_flat_map(|t| (Just(t), arb_delta_for(t))),
        0..=max_len,
    )
    .prop_map(move |steps| {
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (event_type, delta))| {
                builders::event(&format!("{prefix}-{i}"), event_type, &key, delta)
            })
            .collect()
    })
}
