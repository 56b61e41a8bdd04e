//! Hot-reloadable safety stock table.

use inventory_sync_core::policy::SafetyStockPolicy;
use inventory_sync_core::position::PositionKey;
use std::collections::HashMap;
use std::sync::RwLock;

/// Per-position safety stock with a fallback default.
///
/// Values can be replaced while the engine runs; the next ATP computation sees
/// the new value.
#[derive(Debug, Default)]
pub struct SafetyStockTable {
    default: u64,
    values: RwLock<HashMap<PositionKey, u64>>,
}

impl SafetyStockTable {
    /// A table where every position gets `default`.
    #[must_use]
    pub fn new(default: u64) -> Self {
        Self {
            default,
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Set the value for one position.
    pub fn set(&self, key: PositionKey, qty: u64) {
        self.values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key, qty);
    }

    /// Drop the value for one position, reverting it to the default.
    pub fn remove(&self, key: &PositionKey) {
        self.values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }

    /// Replace every explicit value at once.
    pub fn replace_all(&self, values: HashMap<PositionKey, u64>) {
        *self
            .values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = values;
        tracing::info!("Safety stock table reloaded");
    }
}

impl SafetyStockPolicy for SafetyStockTable {
    fn safety_stock(&self, key: &PositionKey) -> u64 {
        self.values
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(self.default)
    }
}
