//! The external source of record and what comparing against it produces.

use crate::position::PositionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Failures talking to the source of record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceOfRecordError {
    /// The source could not be reached.
    #[error("Source of record unreachable: {0}")]
    Unreachable(String),

    /// The source did not answer in time.
    #[error("Source of record timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The source answered with something unusable.
    #[error("Invalid source of record response: {0}")]
    InvalidResponse(String),
}

/// Authoritative on-hand quantities held outside this engine.
pub trait SourceOfRecord: Send + Sync {
    /// On-hand quantities for the given keys.
    ///
    /// Keys the source does not know are omitted from the result.
    ///
    /// # Errors
    ///
    /// Returns [`SourceOfRecordError`] if the source cannot be queried.
    fn on_hand<'a>(
        &'a self,
        keys: &'a [PositionKey],
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<PositionKey, u64>, SourceOfRecordError>> + Send + 'a>>;
}

/// A difference between the local and the authoritative on-hand quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationDiscrepancy {
    /// Which position
    pub key: PositionKey,
    /// Local on hand
    pub local_qty: u64,
    /// Authoritative on hand
    pub source_qty: u64,
    /// `source_qty - local_qty`
    pub delta: i64,
    /// When the difference was found
    pub detected_at: DateTime<Utc>,
}

impl ReconciliationDiscrepancy {
    /// Compare two quantities; `None` when they agree.
    ///
    /// # Examples
    ///
    /// ```
    /// use inventory_sync_core::position::PositionKey;
    /// use inventory_sync_core::reconciliation::ReconciliationDiscrepancy;
    /// use chrono::Utc;
    ///
    /// let key = PositionKey::new("store-1", "sku-1");
    /// let found = ReconciliationDiscrepancy::detect(key.clone(), 50, 45, Utc::now()).unwrap();
    /// assert_eq!(found.delta, -5);
    /// assert!(ReconciliationDiscrepancy::detect(key, 7, 7, Utc::now()).is_none());
    /// ```
    #[must_use]
    pub fn detect(
        key: PositionKey,
        local_qty: u64,
        source_qty: u64,
        detected_at: DateTime<Utc>,
    ) -> Option<Self> {
        if local_qty == source_qty {
            return None;
        }
        let delta = i128::from(source_qty) - i128::from(local_qty);
        let delta = i64::try_from(delta).unwrap_or(if delta < 0 { i64::MIN } else { i64::MAX });
        Some(Self {
            key,
            local_qty,
            source_qty,
            delta,
            detected_at,
        })
    }

    /// Size of the difference.
    #[must_use]
    pub const fn magnitude(&self) -> u64 {
        self.delta.unsigned_abs()
    }
}
