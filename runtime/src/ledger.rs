//! Idempotency ledger: which event IDs have already been applied.
//!
//! Records live for a bounded retention window. Eviction is housekeeping; as
//! long as upstream redelivery windows are shorter than retention, an evicted
//! ID can never come back.
//!
//! The ledger is split into shards keyed by a hash of the event ID, so
//! recording unrelated IDs does not contend on a single lock.

use crate::metrics::LedgerMetrics;
use chrono::{DateTime, Utc};
use inventory_sync_core::environment::chrono_duration;
use inventory_sync_core::event::{EventId, EventType, InventoryChangeEvent, QuantityChange};
use inventory_sync_core::position::PositionKey;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

const SHARDS: usize = 16;

/// One applied event ID, what it changed and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    /// The event ID
    pub event_id: EventId,
    /// Type of the applied event
    pub event_type: EventType,
    /// Position it changed
    pub key: PositionKey,
    /// Change it carried
    pub change: QuantityChange,
    /// When it was applied
    pub applied_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Whether `event` carries the same change as the recorded one.
    #[must_use]
    pub fn matches(&self, event: &InventoryChangeEvent) -> bool {
        self.event_type == event.event_type && self.key == event.key && self.change == event.change
    }
}

#[derive(Debug, Clone)]
struct Applied {
    event_type: EventType,
    key: PositionKey,
    change: QuantityChange,
    applied_at: DateTime<Utc>,
}

type Shard = Mutex<HashMap<EventId, Applied>>;

/// Sharded set of applied event IDs with time-based expiry.
#[derive(Debug)]
pub struct IdempotencyLedger {
    retention: Duration,
    shards: Vec<Shard>,
}

impl IdempotencyLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Retention window.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        self.retention
    }

    fn shard(&self, id: &EventId) -> &Shard {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)] // Only the low bits pick a shard
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Record `event` if its ID is not already present.
    ///
    /// Returns `false` when the ID was already recorded. Check and insert
    /// happen under one lock.
    pub fn try_record(&self, event: &InventoryChangeEvent, applied_at: DateTime<Utc>) -> bool {
        let id = &event.event_id;
        let mut shard = self
            .shard(id)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if shard.contains_key(id) {
            return false;
        }
        shard.insert(
            id.clone(),
            Applied {
                event_type: event.event_type,
                key: event.key.clone(),
                change: event.change,
                applied_at,
            },
        );
        true
    }

    /// Whether `id` has been applied.
    #[must_use]
    pub fn contains(&self, id: &EventId) -> bool {
        self.shard(id)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(id)
    }

    /// The record for `id`, if present.
    #[must_use]
    pub fn get(&self, id: &EventId) -> Option<IdempotencyRecord> {
        self.shard(id)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .map(|applied| IdempotencyRecord {
                event_id: id.clone(),
                event_type: applied.event_type,
                key: applied.key.clone(),
                change: applied.change,
                applied_at: applied.applied_at,
            })
    }

    /// Drop records applied before `now - retention`. Returns how many were dropped.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono_duration(self.retention);
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let before = shard.len();
            shard.retain(|_, applied| applied.applied_at >= cutoff);
            evicted += before - shard.len();
        }
        LedgerMetrics::record_size(self.len());
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired idempotency records");
        }
        evicted
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len())
            .sum()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
