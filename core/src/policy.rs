//! Read-only collaborators consulted when computing availability.

use crate::position::PositionKey;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Failure looking up inbound receipts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Receipt schedule unavailable: {0}")]
pub struct ScheduleError(pub String);

/// Expected inbound receipts.
pub trait ReceiptSchedule: Send + Sync {
    /// Units expected to arrive at `key` before `horizon_end`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] if the schedule cannot be read.
    fn pending_receipts<'a>(
        &'a self,
        key: &'a PositionKey,
        horizon_end: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ScheduleError>> + Send + 'a>>;
}

/// A schedule that never expects anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPendingReceipts;

impl ReceiptSchedule for NoPendingReceipts {
    fn pending_receipts<'a>(
        &'a self,
        _key: &'a PositionKey,
        _horizon_end: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ScheduleError>> + Send + 'a>> {
        Box::pin(async { Ok(0) })
    }
}

/// Configured safety stock per position.
pub trait SafetyStockPolicy: Send + Sync {
    /// Minimum buffer to hold back at `key`.
    fn safety_stock(&self, key: &PositionKey) -> u64;
}
