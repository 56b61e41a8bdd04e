//! The position store: one authoritative position per key, mutated under a
//! per-key critical section.
//!
//! The key map itself is only locked briefly to find or create a slot. Each
//! slot carries its own async mutex; `apply` holds it across the duplicate
//! check, the rule evaluation, the optional guard and the commit, so two
//! applies for the same key never interleave while unrelated keys proceed in
//! parallel. The mutex is FIFO, so same-key applies take effect in call order.

use crate::ledger::IdempotencyLedger;
use crate::metrics::IngestMetrics;
use chrono::{DateTime, Utc};
use inventory_sync_core::environment::Clock;
use inventory_sync_core::event::InventoryChangeEvent;
use inventory_sync_core::policy::SafetyStockPolicy;
use inventory_sync_core::position::{InventoryPosition, PositionKey};
use inventory_sync_core::store::{ApplyOutcome, EventApplier, StoreError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

type Slot = Arc<Mutex<InventoryPosition>>;

/// Result of [`PositionStore::apply_guarded`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<R> {
    /// The guard passed (or the event was a duplicate).
    Completed(ApplyOutcome),
    /// The guard refused; nothing was written or recorded.
    Refused {
        /// Why the guard refused
        reason: R,
        /// The unchanged position
        position: InventoryPosition,
    },
}

/// Keyed map of positions with per-key serialized mutation.
pub struct PositionStore {
    positions: RwLock<HashMap<PositionKey, Slot>>,
    ledger: Arc<IdempotencyLedger>,
    safety_stock: Arc<dyn SafetyStockPolicy>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl PositionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(
        ledger: Arc<IdempotencyLedger>,
        safety_stock: Arc<dyn SafetyStockPolicy>,
        clock: Arc<dyn Clock>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            ledger,
            safety_stock,
            clock,
            lock_timeout,
        }
    }

    /// The ledger guarding this store.
    #[must_use]
    pub fn ledger(&self) -> &Arc<IdempotencyLedger> {
        &self.ledger
    }

    fn slot(&self, key: &PositionKey) -> Slot {
        if let Some(slot) = self
            .positions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(slot);
        }

        let mut positions = self
            .positions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            positions
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(InventoryPosition::empty(key)))),
        )
    }

    fn existing_slot(&self, key: &PositionKey) -> Option<Slot> {
        self.positions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .map(Arc::clone)
    }

    fn stamp(&self, mut position: InventoryPosition) -> InventoryPosition {
        position.safety_stock_qty = self.safety_stock.safety_stock(&position.key());
        position
    }

    /// Apply one event exactly once.
    ///
    /// A recorded event ID returns [`ApplyOutcome::Duplicate`] with the current
    /// position. Decrements that would go below zero clamp and are logged.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Rejected`] if the event breaks the position rules
    /// - [`StoreError::Timeout`] if the key's critical section stays busy
    pub async fn apply(&self, event: &InventoryChangeEvent) -> Result<ApplyOutcome, StoreError> {
        match self
            .apply_guarded(event, |_, _| Ok::<(), std::convert::Infallible>(()))
            .await?
        {
            Guarded::Completed(outcome) => Ok(outcome),
            Guarded::Refused { reason, .. } => match reason {},
        }
    }

    /// Apply one event, letting `guard` veto it inside the critical section.
    ///
    /// `guard` sees the current position and the position the event would
    /// produce. A refusal writes nothing and does not record the event ID, so
    /// the same ID may be submitted again later.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Rejected`] if the event breaks the position rules
    /// - [`StoreError::Timeout`] if the key's critical section stays busy
    #[tracing::instrument(
        skip(self, event, guard),
        fields(event_id = %event.event_id, key = %event.key, event_type = %event.event_type)
    )]
    pub async fn apply_guarded<G, R>(
        &self,
        event: &InventoryChangeEvent,
        guard: G,
    ) -> Result<Guarded<R>, StoreError>
    where
        G: FnOnce(&InventoryPosition, &InventoryPosition) -> Result<(), R> + Send,
        R: Send,
    {
        let slot = self.slot(&event.key);
        let mut current = tokio::time::timeout(self.lock_timeout, slot.lock())
            .await
            .map_err(|_| StoreError::Timeout {
                key: event.key.to_string(),
            })?;

        if self.ledger.contains(&event.event_id) {
            tracing::debug!("Duplicate event, position unchanged");
            return Ok(Guarded::Completed(ApplyOutcome::Duplicate {
                position: self.stamp(current.clone()),
            }));
        }

        let now = self.clock.now();
        let mut applied = current.apply(event, now)?;
        applied.position.safety_stock_qty = self.safety_stock.safety_stock(&event.key);

        if let Err(reason) = guard(&current, &applied.position) {
            return Ok(Guarded::Refused {
                reason,
                position: self.stamp(current.clone()),
            });
        }

        if !self.ledger.try_record(event, now) {
            // Same ID applied concurrently under another key.
            return Ok(Guarded::Completed(ApplyOutcome::Duplicate {
                position: self.stamp(current.clone()),
            }));
        }

        if let Some(anomaly) = applied.anomaly {
            tracing::warn!(
                field = anomaly.field.as_str(),
                requested = anomaly.requested,
                available = anomaly.available,
                "Quantity clamped at zero"
            );
            IngestMetrics::record_clamp(anomaly.field.as_str());
        }

        *current = applied.position.clone();
        tracing::debug!(
            on_hand = current.on_hand_qty,
            allocated = current.allocated_qty,
            in_transit = current.in_transit_qty,
            "Event applied"
        );

        Ok(Guarded::Completed(ApplyOutcome::Applied {
            position: applied.position,
            anomaly: applied.anomaly,
        }))
    }

    /// Snapshot of one position. Unknown keys read as an empty position.
    pub async fn get(&self, key: &PositionKey) -> InventoryPosition {
        match self.existing_slot(key) {
            Some(slot) => self.stamp(slot.lock().await.clone()),
            None => self.stamp(InventoryPosition::empty(key)),
        }
    }

    /// Whether a position exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &PositionKey) -> bool {
        self.existing_slot(key).is_some()
    }

    /// All known keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<PositionKey> {
        let mut keys: Vec<_> = self
            .positions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Number of known positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no positions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed positions at startup, before any event is applied.
    ///
    /// Existing positions for the same keys are replaced.
    pub async fn restore(&self, positions: impl IntoIterator<Item = InventoryPosition>) {
        for position in positions {
            let slot = self.slot(&position.key());
            *slot.lock().await = position;
        }
    }

    /// Stamp the time of the last successful comparison with the source of record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Timeout`] if the key's critical section stays busy.
    pub async fn mark_synced(&self, key: &PositionKey, at: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(slot) = self.existing_slot(key) else {
            return Ok(());
        };
        let mut current = tokio::time::timeout(self.lock_timeout, slot.lock())
            .await
            .map_err(|_| StoreError::Timeout {
                key: key.to_string(),
            })?;
        current.last_sync_time = Some(at);
        Ok(())
    }
}

impl EventApplier for PositionStore {
    fn apply<'a>(
        &'a self,
        event: &'a InventoryChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, StoreError>> + Send + 'a>> {
        Box::pin(Self::apply(self, event))
    }
}
