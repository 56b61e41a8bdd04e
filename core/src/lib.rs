//! # Inventory Sync Core
//!
//! Data model and collaborator traits for the inventory position sync engine.
//!
//! The engine ingests quantity-changing events for (location, item) pairs,
//! keeps an authoritative local view of on-hand, allocated and in-transit
//! quantities, gates reservations on available-to-promise, and reconciles
//! against an external source of record.
//!
//! This crate holds no I/O. It defines:
//!
//! - **Events**: the wire envelope and its validation ([`event`])
//! - **Positions**: quantity state and the pure update rules ([`position`])
//! - **Seams**: traits the runtime is composed from ([`store`], [`event_bus`],
//!   [`audit`], [`reconciliation`], [`policy`], [`dead_letter`], [`environment`])
//!
//! ## Example
//!
//! ```
//! use inventory_sync_core::event::decode_event;
//! use inventory_sync_core::position::{InventoryPosition, PositionKey};
//! use chrono::Utc;
//!
//! let payload = br#"{
//!     "eventId": "E1",
//!     "eventType": "SALE",
//!     "locationId": "store-1",
//!     "itemId": "sku-1",
//!     "quantityDelta": -20,
//!     "eventTime": "2025-01-01T10:00:00Z"
//! }"#;
//! let event = decode_event(payload).unwrap();
//!
//! let position = InventoryPosition {
//!     on_hand_qty: 100,
//!     ..InventoryPosition::empty(&PositionKey::new("store-1", "sku-1"))
//! };
//! let next = position.apply(&event, Utc::now()).unwrap().position;
//! assert_eq!(next.on_hand_qty, 80);
//! ```

pub mod audit;
pub mod dead_letter;
pub mod environment;
pub mod event;
pub mod event_bus;
pub mod policy;
pub mod position;
pub mod reconciliation;
pub mod store;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub use audit::{AlertSeverity, AuditError, AuditRecord, AuditSink, DiscrepancyResolution, EventOutcome};
pub use dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterId, DeadLetterStatus, DeadLetterStore, FailureKind,
};
pub use environment::{Clock, SystemClock};
pub use event::{
    EventId, EventType, InventoryChangeEvent, QuantityChange, RawInventoryEvent, ValidationError,
    decode_event,
};
pub use event_bus::{Acknowledge, Delivery, DeliveryStream, EventBusError, EventSource};
pub use policy::{NoPendingReceipts, ReceiptSchedule, SafetyStockPolicy, ScheduleError};
pub use position::{AppliedChange, ClampAnomaly, InventoryPosition, PositionKey, QuantityField};
pub use reconciliation::{ReconciliationDiscrepancy, SourceOfRecord, SourceOfRecordError};
pub use store::{ApplyOutcome, EventApplier, StoreError};
