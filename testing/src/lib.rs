//! # Inventory Sync Testing
//!
//! Test doubles and helpers for the inventory sync engine.
//!
//! This crate provides:
//! - Deterministic implementations of the collaborator traits ([`mocks`])
//! - An in-memory broker with acknowledgement tracking ([`event_bus`])
//! - Event builders ([`builders`]) and proptest strategies ([`properties`])
//!
//! ## Example
//!
//! ```
//! use inventory_sync_testing::{builders, test_clock};
//! use inventory_sync_core::environment::Clock;
//! use inventory_sync_core::position::PositionKey;
//!
//! let clock = test_clock();
//! let start = clock.now();
//! clock.advance(std::time::Duration::from_secs(60));
//! assert_eq!((clock.now() - start).num_seconds(), 60);
//!
//! let sale = builders::sale("E1", &PositionKey::new("store-1", "sku-1"), 20);
//! assert_eq!(sale.quantity_delta(), -20);
//! ```

pub mod builders;
pub mod event_bus;
pub mod mocks;
pub mod properties;

pub use event_bus::InMemoryEventBus;
pub use mocks::{
    FlakyApplier, ManualClock, RecordingAuditSink, ScriptedSourceOfRecord, StaticReceiptSchedule,
    test_clock,
};

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
