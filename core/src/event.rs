//! The wire contract for quantity-changing facts.
//!
//! Producers publish a JSON envelope per change:
//!
//! ```json
//! {
//!   "eventId": "E1",
//!   "eventType": "SALE",
//!   "locationId": "store-12",
//!   "itemId": "sku-778",
//!   "quantityDelta": -20,
//!   "sourceSystem": "pos",
//!   "eventTime": "2025-01-01T10:00:00Z",
//!   "correlationId": "basket-93"
//! }
//! ```
//!
//! The envelope is decoded into a [`RawInventoryEvent`], where every field is
//! optional, and then validated into an [`InventoryChangeEvent`]. Only validated
//! events ever reach the position store.
//!
//! # Sign conventions
//!
//! The sign of `quantityDelta` is the direction of change on the affected field:
//!
//! | Event type | Field | Wire value |
//! |------------|-------|------------|
//! | `SALE`, `TRANSFER_OUT` | on hand | `<= 0` |
//! | `RECEIPT`, `TRANSFER_IN` | on hand (out of in transit) | `>= 0` |
//! | `RESERVE` | allocated | `>= 0` |
//! | `RELEASE` | allocated | `<= 0` |
//! | `ADJUSTMENT` | on hand | absolute target, `>= 0` |
//!
//! `ADJUSTMENT` is the only absolute-set event. After validation it is carried
//! as [`QuantityChange::SetOnHand`] so it can never be mistaken for a delta.

use crate::position::PositionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Reasons an inbound event is rejected before it reaches the store.
///
/// Validation failures are never retried: the same payload fails the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The payload is not a decodable envelope.
    #[error("Malformed event payload: {0}")]
    Malformed(String),

    /// A required field is absent.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A required field is present but blank.
    #[error("Field must not be empty: {0}")]
    EmptyField(&'static str),

    /// The event type is not one of the known variants.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The delta sign contradicts the event type's convention.
    #[error("Invalid quantity delta {delta} for {event_type}")]
    InvalidSign {
        /// The event type
        event_type: EventType,
        /// The offending delta
        delta: i64,
    },

    /// An absolute target below zero.
    #[error("Adjustment target must not be negative: {0}")]
    NegativeTarget(i64),

    /// The change variant does not match the event type.
    #[error("Quantity change {change:?} is not valid for {event_type}")]
    MismatchedChange {
        /// The event type
        event_type: EventType,
        /// The change carried by the event
        change: QuantityChange,
    },

    /// The event ID was already applied to a different change.
    #[error("Event ID {0} was already used for a different change")]
    ConflictingEventId(EventId),
}

/// Globally unique event identifier, used as the idempotency key.
///
/// # Examples
///
/// ```
/// use inventory_sync_core::event::EventId;
///
/// let id = EventId::new("E1");
/// assert_eq!(id.as_str(), "E1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Create an event ID from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Deterministic ID for a tuple of components.
    ///
    /// Each component is length-prefixed before hashing, so tuples that
    /// join to the same text still get distinct IDs.
    ///
    /// ```
    /// use inventory_sync_core::event::EventId;
    ///
    /// let a = EventId::derived("recon", &["a-b", "c"]);
    /// let b = EventId::derived("recon", &["a", "b-c"]);
    /// assert_ne!(a, b);
    /// assert_eq!(a, EventId::derived("recon", &["a-b", "c"]));
    /// ```
    #[must_use]
    pub fn derived(prefix: &str, components: &[&str]) -> Self {
        let mut name = Vec::new();
        for component in components {
            let len = u64::try_from(component.len()).unwrap_or(u64::MAX);
            name.extend_from_slice(&len.to_be_bytes());
            name.extend_from_slice(component.as_bytes());
        }
        let digest = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, &name);
        Self(format!("{prefix}-{digest}"))
    }

    /// The underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kinds of quantity-changing facts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Units sold (on hand decreases)
    Sale,
    /// Units received (on hand increases, in transit drains)
    Receipt,
    /// Absolute on-hand correction
    Adjustment,
    /// Units arriving from another location
    TransferIn,
    /// Units leaving for another location
    TransferOut,
    /// Units allocated to future fulfillment
    Reserve,
    /// Allocation returned
    Release,
}

impl EventType {
    /// All variants, in wire order.
    pub const ALL: [Self; 7] = [
        Self::Sale,
        Self::Receipt,
        Self::Adjustment,
        Self::TransferIn,
        Self::TransferOut,
        Self::Reserve,
        Self::Release,
    ];

    /// Wire name of the variant.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sale => "SALE",
            Self::Receipt => "RECEIPT",
            Self::Adjustment => "ADJUSTMENT",
            Self::TransferIn => "TRANSFER_IN",
            Self::TransferOut => "TRANSFER_OUT",
            Self::Reserve => "RESERVE",
            Self::Release => "RELEASE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownEventType(s.to_string()))
    }
}

/// How an event changes quantities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantityChange {
    /// Signed change to the field the event type targets.
    Delta(i64),
    /// Absolute on-hand target (`ADJUSTMENT` only).
    SetOnHand(u64),
}

/// The concrete mutation an event performs, derived from its type and change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PositionEffect {
    DecreaseOnHand(u64),
    IncreaseOnHand(u64),
    SetOnHand(u64),
    Allocate(u64),
    Deallocate(u64),
}

/// A validated quantity-changing event.
///
/// Construct with [`InventoryChangeEvent::new`] or by validating a
/// [`RawInventoryEvent`]; both enforce the sign conventions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryChangeEvent {
    /// Idempotency key
    pub event_id: EventId,
    /// What kind of fact this is
    pub event_type: EventType,
    /// Which position it changes
    pub key: PositionKey,
    /// Delta or absolute target
    pub change: QuantityChange,
    /// Producing system
    pub source_system: String,
    /// When the fact happened upstream
    pub event_time: DateTime<Utc>,
    /// Correlation across systems
    pub correlation_id: String,
}

impl InventoryChangeEvent {
    /// Build a validated event from wire-level values.
    ///
    /// `quantity_delta` follows the sign conventions in the module docs; for
    /// `ADJUSTMENT` it is the absolute on-hand target.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for blank key components or a delta that
    /// contradicts the event type.
    ///
    /// # Examples
    ///
    /// ```
    /// use inventory_sync_core::event::{EventType, InventoryChangeEvent, QuantityChange};
    /// use inventory_sync_core::position::PositionKey;
    /// use chrono::Utc;
    ///
    /// let sale = InventoryChangeEvent::new(
    ///     "E1",
    ///     EventType::Sale,
    ///     PositionKey::new("store-1", "sku-1"),
    ///     -20,
    ///     "pos",
    ///     Utc::now(),
    ///     "basket-1",
    /// )
    /// .unwrap();
    /// assert_eq!(sale.change, QuantityChange::Delta(-20));
    ///
    /// let bad = InventoryChangeEvent::new(
    ///     "E2",
    ///     EventType::Sale,
    ///     PositionKey::new("store-1", "sku-1"),
    ///     5,
    ///     "pos",
    ///     Utc::now(),
    ///     "basket-2",
    /// );
    /// assert!(bad.is_err());
    /// ```
    pub fn new(
        event_id: impl Into<EventId>,
        event_type: EventType,
        key: PositionKey,
        quantity_delta: i64,
        source_system: impl Into<String>,
        event_time: DateTime<Utc>,
        correlation_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let event_id = event_id.into();
        if event_id.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyField("eventId"));
        }
        if key.location_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("locationId"));
        }
        if key.item_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("itemId"));
        }

        let change = if event_type == EventType::Adjustment {
            let target = u64::try_from(quantity_delta)
                .map_err(|_| ValidationError::NegativeTarget(quantity_delta))?;
            QuantityChange::SetOnHand(target)
        } else {
            QuantityChange::Delta(quantity_delta)
        };

        let event = Self {
            event_id,
            event_type,
            key,
            change,
            source_system: source_system.into(),
            event_time,
            correlation_id: correlation_id.into(),
        };
        event.effect()?;
        Ok(event)
    }

    /// The value this event carries on the wire as `quantityDelta`.
    #[must_use]
    pub fn quantity_delta(&self) -> i64 {
        match self.change {
            QuantityChange::Delta(d) => d,
            QuantityChange::SetOnHand(target) => i64::try_from(target).unwrap_or(i64::MAX),
        }
    }

    /// Resolve the mutation this event performs.
    ///
    /// Re-checked at apply time so hand-built events with a mismatched change
    /// are rejected by the store too.
    pub(crate) fn effect(&self) -> Result<PositionEffect, ValidationError> {
        let invalid_sign = |delta: i64| ValidationError::InvalidSign {
            event_type: self.event_type,
            delta,
        };

        match (self.event_type, self.change) {
            (EventType::Adjustment, QuantityChange::SetOnHand(target)) => {
                Ok(PositionEffect::SetOnHand(target))
            },
            (EventType::Sale | EventType::TransferOut, QuantityChange::Delta(d)) => {
                if d > 0 {
                    Err(invalid_sign(d))
                } else {
                    Ok(PositionEffect::DecreaseOnHand(d.unsigned_abs()))
                }
            },
            (EventType::Receipt | EventType::TransferIn, QuantityChange::Delta(d)) => {
                if d < 0 {
                    Err(invalid_sign(d))
                } else {
                    Ok(PositionEffect::IncreaseOnHand(d.unsigned_abs()))
                }
            },
            (EventType::Reserve, QuantityChange::Delta(d)) => {
                if d < 0 {
                    Err(invalid_sign(d))
                } else {
                    Ok(PositionEffect::Allocate(d.unsigned_abs()))
                }
            },
            (EventType::Release, QuantityChange::Delta(d)) => {
                if d > 0 {
                    Err(invalid_sign(d))
                } else {
                    Ok(PositionEffect::Deallocate(d.unsigned_abs()))
                }
            },
            (event_type, change) => Err(ValidationError::MismatchedChange { event_type, change }),
        }
    }

    /// Check the event against the sign conventions.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the change does not fit the event type.
    pub fn check(&self) -> Result<(), ValidationError> {
        self.effect().map(|_| ())
    }

    /// Convert back to the wire envelope.
    #[must_use]
    pub fn to_raw(&self) -> RawInventoryEvent {
        RawInventoryEvent {
            event_id: Some(self.event_id.as_str().to_string()),
            event_type: Some(self.event_type.as_str().to_string()),
            location_id: Some(self.key.location_id.clone()),
            item_id: Some(self.key.item_id.clone()),
            quantity_delta: Some(self.quantity_delta()),
            source_system: Some(self.source_system.clone()),
            event_time: Some(self.event_time),
            correlation_id: Some(self.correlation_id.clone()),
        }
    }

    /// Encode as a JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_raw())
    }
}

/// The wire envelope before validation.
///
/// Every field is optional so that a malformed event can still be partially
/// read (for dead-letter identity and diagnostics) instead of failing
/// wholesale at decode time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInventoryEvent {
    /// `eventId`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// `eventType`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// `locationId`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    /// `itemId`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// `quantityDelta`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_delta: Option<i64>,
    /// `sourceSystem`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_system: Option<String>,
    /// `eventTime`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,
    /// `correlationId`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl RawInventoryEvent {
    /// Decode a JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Malformed`] if the bytes are not a JSON object
    /// of the expected shape.
    pub fn from_json(payload: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(payload).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// The position key, if both components are present.
    #[must_use]
    pub fn key_hint(&self) -> Option<PositionKey> {
        match (&self.location_id, &self.item_id) {
            (Some(location), Some(item)) if !location.is_empty() && !item.is_empty() => {
                Some(PositionKey::new(location.clone(), item.clone()))
            },
            _ => None,
        }
    }

    /// Validate into an [`InventoryChangeEvent`].
    ///
    /// `sourceSystem` defaults to `"unknown"` and `correlationId` to the event ID
    /// when absent; everything else is required.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered.
    pub fn validate(self) -> Result<InventoryChangeEvent, ValidationError> {
        let event_id = self.event_id.ok_or(ValidationError::MissingField("eventId"))?;
        let event_type: EventType = self
            .event_type
            .ok_or(ValidationError::MissingField("eventType"))?
            .parse()?;
        let location_id = self
            .location_id
            .ok_or(ValidationError::MissingField("locationId"))?;
        let item_id = self.item_id.ok_or(ValidationError::MissingField("itemId"))?;
        let quantity_delta = self
            .quantity_delta
            .ok_or(ValidationError::MissingField("quantityDelta"))?;
        let event_time = self
            .event_time
            .ok_or(ValidationError::MissingField("eventTime"))?;
        let correlation_id = self.correlation_id.unwrap_or_else(|| event_id.clone());
        let source_system = self.source_system.unwrap_or_else(|| "unknown".to_string());

        InventoryChangeEvent::new(
            event_id,
            event_type,
            PositionKey::new(location_id, item_id),
            quantity_delta,
            source_system,
            event_time,
            correlation_id,
        )
    }
}

/// Decode and validate a JSON envelope in one step.
///
/// # Errors
///
/// Returns [`ValidationError`] if the payload is malformed or invalid.
pub fn decode_event(payload: &[u8]) -> Result<InventoryChangeEvent, ValidationError> {
    RawInventoryEvent::from_json(payload)?.validate()
}
