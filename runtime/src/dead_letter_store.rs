//! In-memory dead-letter store.
//!
//! Used when no database is configured, and in tests. Unlike a plain bounded
//! queue it never drops entries: escalated events must stay visible until an
//! operator resolves them.

use chrono::{DateTime, Utc};
use inventory_sync_core::dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterId, DeadLetterStatus, DeadLetterStore,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Thread-safe in-memory [`DeadLetterStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Arc<Mutex<HashMap<DeadLetterId, DeadLetterEntry>>>,
}

impl InMemoryDeadLetterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in any status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(
        &self,
        limit: usize,
        filter: impl Fn(&DeadLetterEntry) -> bool,
        order: impl Fn(&DeadLetterEntry) -> DateTime<Utc>,
    ) -> Vec<DeadLetterEntry> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut selected: Vec<_> = entries.values().filter(|e| filter(e)).cloned().collect();
        selected.sort_by(|a, b| order(a).cmp(&order(b)).then_with(|| a.id.cmp(&b.id)));
        selected.truncate(limit);
        selected
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn upsert(
        &self,
        entry: DeadLetterEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(entry.id.clone(), entry);
        Box::pin(async { Ok(()) })
    }

    fn get<'a>(
        &'a self,
        id: &'a DeadLetterId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeadLetterEntry>, DeadLetterError>> + Send + 'a>>
    {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .cloned();
        Box::pin(async move { Ok(entry) })
    }

    fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, DeadLetterError>> + Send + '_>>
    {
        let due = self.select(
            limit,
            |e| e.is_due(now),
            |e| e.next_attempt_at.unwrap_or(e.last_failed_at),
        );
        Box::pin(async move { Ok(due) })
    }

    fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, DeadLetterError>> + Send + '_>>
    {
        let listed = self.select(
            limit,
            |e| status.is_none_or(|s| e.status == s),
            |e| e.first_failed_at,
        );
        Box::pin(async move { Ok(listed) })
    }

    fn count(
        &self,
        status: DeadLetterStatus,
    ) -> Pin<Box<dyn Future<Output = Result<usize, DeadLetterError>> + Send + '_>> {
        let count = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|e| e.status == status)
            .count();
        Box::pin(async move { Ok(count) })
    }
}
