//! # Inventory Sync Runtime
//!
//! The moving parts of the inventory position sync engine.
//!
//! ## Core Components
//!
//! - **Position Store**: one position per key, mutated under a per-key
//!   critical section and guarded by the idempotency ledger
//! - **Availability Calculator**: ATP and oversell-safe reservations
//! - **Ingestion**: decode, validate, apply and audit each delivery, with a
//!   key-partitioned broker consumer in front
//! - **Dead-Letter Manager**: backoff redelivery, escalation, replay
//! - **Reconciliation Scheduler**: periodic comparison with the source of
//!   record and small-delta auto-correction
//!
//! ## Example
//!
//! ```
//! use inventory_sync_core::event::{EventType, InventoryChangeEvent};
//! use inventory_sync_core::position::PositionKey;
//! use inventory_sync_core::environment::SystemClock;
//! use inventory_sync_core::policy::NoPendingReceipts;
//! use inventory_sync_runtime::availability::AvailabilityCalculator;
//! use inventory_sync_runtime::ledger::IdempotencyLedger;
//! use inventory_sync_runtime::safety_stock::SafetyStockTable;
//! use inventory_sync_runtime::store::PositionStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(PositionStore::new(
//!     Arc::new(IdempotencyLedger::new(Duration::from_secs(86_400))),
//!     Arc::new(SafetyStockTable::new(10)),
//!     Arc::new(SystemClock),
//!     Duration::from_secs(1),
//! ));
//! let key = PositionKey::new("store-1", "sku-1");
//! let receipt = InventoryChangeEvent::new(
//!     "E0", EventType::Receipt, key.clone(), 100, "wms", chrono::Utc::now(), "E0",
//! ).unwrap();
//! store.apply(&receipt).await.unwrap();
//!
//! let atp = AvailabilityCalculator::new(
//!     store,
//!     Arc::new(NoPendingReceipts),
//!     Arc::new(SystemClock),
//!     Duration::from_secs(86_400),
//! );
//! assert!(atp.reserve(&key, 85).await.unwrap().is_accepted());
//! assert!(!atp.reserve(&key, 10).await.unwrap().is_accepted());
//! # });
//! ```

pub mod availability;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod dead_letter_store;
pub mod engine;
pub mod ingest;
pub mod ledger;
pub mod reconcile;
pub mod safety_stock;
pub mod schedule;
pub mod store;

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

pub use availability::{AvailabilityCalculator, RejectionReason, ReleaseAck, ReservationOutcome};
pub use config::{ConfigError, SyncConfig};
pub use consumer::IngestionConsumer;
pub use dead_letter::{DeadLetterManager, Redeliver, SweepReport};
pub use dead_letter_store::InMemoryDeadLetterStore;
pub use engine::{Collaborators, SyncEngine};
pub use ingest::{IngestFailure, IngestOutcome, IngestPipeline};
pub use ledger::{IdempotencyLedger, IdempotencyRecord};
pub use reconcile::{CycleReport, ReconciliationScheduler, ReconciliationSettings};
pub use retry::RetryPolicy;
pub use safety_stock::SafetyStockTable;
pub use store::{Guarded, PositionStore};
