//! Dead-letter records for events that could not be applied.
//!
//! Entries are keyed by [`DeadLetterId`]: the event ID when the payload carried
//! one, otherwise a name-based UUID of the payload bytes. Repeat failures of the
//! same event update one entry instead of adding another.

use crate::event::RawInventoryEvent;
use crate::position::PositionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from dead-letter storage and management.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// No entry with this ID.
    #[error("Dead-letter entry not found: {0}")]
    NotFound(String),

    /// The entry is in a terminal state.
    #[error("Dead-letter entry {id} cannot be changed in status {status}")]
    InvalidState {
        /// Entry ID
        id: String,
        /// Current status
        status: DeadLetterStatus,
    },

    /// Backend failure.
    #[error("Dead-letter storage error: {0}")]
    Storage(String),
}

/// Identity of a dead-letter entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(String);

impl DeadLetterId {
    /// Wrap an existing ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the ID for a payload.
    ///
    /// # Examples
    ///
    /// ```
    /// use inventory_sync_core::dead_letter::DeadLetterId;
    ///
    /// let id = DeadLetterId::for_payload(br#"{"eventId":"E7"}"#);
    /// assert_eq!(id.as_str(), "E7");
    ///
    /// let a = DeadLetterId::for_payload(b"garbage");
    /// let b = DeadLetterId::for_payload(b"garbage");
    /// assert_eq!(a, b);
    /// assert!(a.as_str().starts_with("unidentified-"));
    /// ```
    #[must_use]
    pub fn for_payload(payload: &[u8]) -> Self {
        match RawInventoryEvent::from_json(payload)
            .ok()
            .and_then(|raw| raw.event_id)
            .filter(|id| !id.trim().is_empty())
        {
            Some(id) => Self(id),
            None => Self(format!(
                "unidentified-{}",
                uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, payload)
            )),
        }
    }

    /// The underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    /// Waiting for an automatic retry at `next_attempt_at`
    Pending,
    /// Retries exhausted or not applicable; needs an operator
    Escalated,
    /// Re-applied successfully
    Resolved,
    /// Dropped by an operator
    Discarded,
}

impl DeadLetterStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the string is not a known status.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(Self::Pending),
            "escalated" => Ok(Self::Escalated),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterError::Storage(format!(
                "Invalid dead-letter status: {s}"
            ))),
        }
    }

    /// Whether the entry is finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Discarded)
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an event ended up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or rule-breaking; retrying the same bytes cannot help
    Validation,
    /// Store unavailable or contended after local retries
    Transient,
    /// Processing exceeded its deadline
    Timeout,
}

impl FailureKind {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the string is not a known kind.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "validation" => Ok(Self::Validation),
            "transient" => Ok(Self::Transient),
            "timeout" => Ok(Self::Timeout),
            _ => Err(DeadLetterError::Storage(format!(
                "Invalid failure kind: {s}"
            ))),
        }
    }

    /// Whether automatic redelivery is worth attempting.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation)
    }
}

/// A failed event plus its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Entry identity
    pub id: DeadLetterId,
    /// Event ID, if the payload carried one
    pub event_id: Option<String>,
    /// Position key, if the payload carried one
    pub key: Option<PositionKey>,
    /// Raw envelope bytes as received (or as last corrected)
    #[serde(with = "payload_text")]
    pub payload: Vec<u8>,
    /// Classification of the latest failure
    pub failure: FailureKind,
    /// Latest failure message
    pub error_message: String,
    /// Automatic redeliveries attempted so far
    pub attempts: u32,
    /// Lifecycle status
    pub status: DeadLetterStatus,
    /// When the event first failed
    pub first_failed_at: DateTime<Utc>,
    /// When the event most recently failed
    pub last_failed_at: DateTime<Utc>,
    /// When the next automatic retry is due (pending entries only)
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the entry reached a terminal status
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator notes
    pub resolution_notes: Option<String>,
}

impl DeadLetterEntry {
    /// A new entry for a first failure.
    #[must_use]
    pub fn new(
        payload: Vec<u8>,
        failure: FailureKind,
        error_message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let raw = RawInventoryEvent::from_json(&payload).ok();
        Self {
            id: DeadLetterId::for_payload(&payload),
            event_id: raw.as_ref().and_then(|r| r.event_id.clone()),
            key: raw.as_ref().and_then(RawInventoryEvent::key_hint),
            payload,
            failure,
            error_message: error_message.into(),
            attempts: 0,
            status: DeadLetterStatus::Pending,
            first_failed_at: at,
            last_failed_at: at,
            next_attempt_at: None,
            resolved_at: None,
            resolution_notes: None,
        }
    }

    /// Whether a pending entry is due for retry at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeadLetterStatus::Pending
            && self.next_attempt_at.is_some_and(|at| at <= now)
    }
}

mod payload_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(deserializer).map(String::into_bytes)
    }
}

/// Storage for dead-letter entries.
///
/// Implementations only persist; retry scheduling and escalation live in the
/// runtime's dead-letter manager, which serializes writes per entry ID.
pub trait DeadLetterStore: Send + Sync {
    /// Insert or replace the entry with the same ID.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] on backend failure.
    fn upsert(
        &self,
        entry: DeadLetterEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;

    /// Fetch one entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] on backend failure.
    fn get<'a>(
        &'a self,
        id: &'a DeadLetterId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeadLetterEntry>, DeadLetterError>> + Send + 'a>>;

    /// Pending entries whose retry is due, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] on backend failure.
    fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, DeadLetterError>> + Send + '_>>;

    /// Entries, optionally filtered by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] on backend failure.
    fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, DeadLetterError>> + Send + '_>>;

    /// Number of entries in a status.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] on backend failure.
    fn count(
        &self,
        status: DeadLetterStatus,
    ) -> Pin<Box<dyn Future<Output = Result<usize, DeadLetterError>> + Send + '_>>;
}
