//! Deterministic collaborators for tests.

use chrono::{DateTime, Utc};
use inventory_sync_core::audit::{AuditError, AuditRecord, AuditSink, EventOutcome};
use inventory_sync_core::environment::{Clock, chrono_duration};
use inventory_sync_core::event::InventoryChangeEvent;
use inventory_sync_core::policy::{ReceiptSchedule, ScheduleError};
use inventory_sync_core::position::PositionKey;
use inventory_sync_core::reconciliation::{SourceOfRecord, SourceOfRecordError};
use inventory_sync_core::store::{ApplyOutcome, EventApplier, StoreError};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and give
/// another to the engine.
///
/// # Example
///
/// ```
/// use inventory_sync_testing::mocks::ManualClock;
/// use inventory_sync_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = ManualClock::new(Utc::now());
/// let observer = clock.clone();
/// let before = observer.now();
/// clock.advance(std::time::Duration::from_secs(5));
/// assert_eq!((observer.now() - before).num_seconds(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    time: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock stopped at `time`.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(Mutex::new(time)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
        *time += chrono_duration(by);
    }

    /// Jump to `time`.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A manual clock stopped at 2025-01-01 00:00:00 UTC.
#[must_use]
pub fn test_clock() -> ManualClock {
    ManualClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
}

/// Audit sink that keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `record` call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Outcomes of processed events, in order.
    #[must_use]
    pub fn outcomes(&self) -> Vec<(Option<String>, EventOutcome)> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                AuditRecord::EventProcessed {
                    event_id, outcome, ..
                } => Some((event_id, outcome)),
                _ => None,
            })
            .collect()
    }

    /// Only the discrepancy records.
    #[must_use]
    pub fn discrepancies(&self) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| matches!(r, AuditRecord::Discrepancy { .. }))
            .collect()
    }

    /// Only the alerts.
    #[must_use]
    pub fn alerts(&self) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| matches!(r, AuditRecord::Alert { .. }))
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(
        &self,
        record: AuditRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), AuditError>> + Send + '_>> {
        let result = if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            Err(AuditError::Unavailable("recording sink set to fail".to_string()))
        } else {
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record);
            Ok(())
        };
        Box::pin(async move { result })
    }
}

#[derive(Debug, Default)]
struct SourceState {
    on_hand: HashMap<PositionKey, u64>,
    failure: Option<SourceOfRecordError>,
    stall: bool,
    calls: usize,
}

/// Source of record whose answers the test controls.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSourceOfRecord {
    state: Arc<Mutex<SourceState>>,
}

impl ScriptedSourceOfRecord {
    /// Create a source that knows no keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report `qty` on hand for `key`.
    pub fn set(&self, key: PositionKey, qty: u64) {
        self.state().on_hand.insert(key, qty);
    }

    /// Fail every query with `error` until [`recover`](Self::recover).
    pub fn fail_with(&self, error: SourceOfRecordError) {
        self.state().failure = Some(error);
    }

    /// Never answer, so the caller's timeout fires.
    pub fn stall(&self) {
        self.state().stall = true;
    }

    /// Answer normally again.
    pub fn recover(&self) {
        let mut state = self.state();
        state.failure = None;
        state.stall = false;
    }

    /// Number of queries received.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.state().calls
    }
}

impl SourceOfRecord for ScriptedSourceOfRecord {
    fn on_hand<'a>(
        &'a self,
        keys: &'a [PositionKey],
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<PositionKey, u64>, SourceOfRecordError>> + Send + 'a>>
    {
        let (stall, result) = {
            let mut state = self.state();
            state.calls += 1;
            let result = match &state.failure {
                Some(error) => Err(error.clone()),
                None => Ok(keys
                    .iter()
                    .filter_map(|k| state.on_hand.get(k).map(|qty| (k.clone(), *qty)))
                    .collect()),
            };
            (state.stall, result)
        };
        Box::pin(async move {
            if stall {
                std::future::pending::<()>().await;
            }
            result
        })
    }
}

/// Receipt schedule backed by a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticReceiptSchedule {
    pending: Arc<Mutex<HashMap<PositionKey, u64>>>,
    failing: Arc<Mutex<bool>>,
}

impl StaticReceiptSchedule {
    /// Create a schedule that expects nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `qty` units at `key` within any horizon.
    pub fn set(&self, key: PositionKey, qty: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, qty);
    }

    /// Make lookups fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }
}

impl ReceiptSchedule for StaticReceiptSchedule {
    fn pending_receipts<'a>(
        &'a self,
        key: &'a PositionKey,
        _horizon_end: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ScheduleError>> + Send + 'a>> {
        let result = if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            Err(ScheduleError("static schedule set to fail".to_string()))
        } else {
            Ok(self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .copied()
                .unwrap_or(0))
        };
        Box::pin(async move { result })
    }
}

enum Injected {
    Fail(StoreError),
    Stall,
}

/// Wraps an applier and injects failures ahead of real applies.
pub struct FlakyApplier {
    inner: Arc<dyn EventApplier>,
    injected: Mutex<VecDeque<Injected>>,
    outage: Mutex<Option<StoreError>>,
    calls: AtomicUsize,
}

impl FlakyApplier {
    /// Wrap `inner`; with nothing injected every call passes through.
    #[must_use]
    pub fn new(inner: Arc<dyn EventApplier>) -> Self {
        Self {
            inner,
            injected: Mutex::new(VecDeque::new()),
            outage: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `times` calls with `error`.
    pub fn fail_next(&self, times: usize, error: &StoreError) {
        let mut injected = self.injected.lock().unwrap_or_else(PoisonError::into_inner);
        injected.extend((0..times).map(|_| Injected::Fail(error.clone())));
    }

    /// Make the next `times` calls hang forever.
    pub fn stall_next(&self, times: usize) {
        let mut injected = self.injected.lock().unwrap_or_else(PoisonError::into_inner);
        injected.extend((0..times).map(|_| Injected::Stall));
    }

    /// Fail every call with `error` until cleared with `None`.
    ///
    /// Takes precedence over injected one-off failures.
    pub fn set_outage(&self, error: Option<StoreError>) {
        *self.outage.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Calls received, injected or not.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EventApplier for FlakyApplier {
    fn apply<'a>(
        &'a self,
        event: &'a InventoryChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, StoreError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self
            .outage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Box::pin(async move { Err(error) });
        }
        let next = self
            .injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(Injected::Fail(error)) => Box::pin(async move { Err(error) }),
            Some(Injected::Stall) => Box::pin(std::future::pending()),
            None => self.inner.apply(event),
        }
    }
}
