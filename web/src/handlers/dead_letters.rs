//! Operator endpoints for the dead-letter store.
//!
//! ```text
//! GET  /api/dead-letters?status=pending&limit=50
//! GET  /api/dead-letters/:id
//! POST /api/dead-letters/:id/replay     { "payload": { ... } }   (body optional)
//! POST /api/dead-letters/:id/discard    { "reason": "..." }
//! ```
//!
//! A corrected payload may be given as a JSON object (the envelope itself) or
//! as a string holding the raw envelope text.

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
};
use inventory_sync_core::dead_letter::{DeadLetterEntry, DeadLetterId, DeadLetterStatus};
use serde::Deserialize;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// Query parameters for listing.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Only entries in this status
    pub status: Option<DeadLetterStatus>,
    /// Page size, capped at 1000
    pub limit: Option<usize>,
}

/// List entries, oldest failure first.
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DeadLetterEntry>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let entries = state.dead_letters.list(params.status, limit).await?;
    Ok(Json(entries))
}

/// Fetch one entry.
pub async fn get_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeadLetterEntry>, AppError> {
    let id = DeadLetterId::new(id);
    state
        .dead_letters
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found("Dead-letter entry", &id))
}

/// Body of a replay request.
#[derive(Debug, Default, Deserialize)]
pub struct ReplayRequest {
    /// Corrected envelope; omitted to replay the stored payload unchanged
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl ReplayRequest {
    fn corrected_payload(self) -> Result<Option<Vec<u8>>, AppError> {
        match self.payload {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(text)) => Ok(Some(text.into_bytes())),
            Some(value) => serde_json::to_vec(&value)
                .map(Some)
                .map_err(|e| AppError::bad_request(format!("Unusable payload: {e}"))),
        }
    }
}

/// Re-apply an entry, optionally with a corrected payload.
///
/// The entry comes back `resolved` when the apply succeeded and `escalated`
/// when it failed again.
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<ReplayRequest>>,
) -> Result<Json<DeadLetterEntry>, AppError> {
    let id = DeadLetterId::new(id);
    let corrected = request
        .map(|Json(r)| r)
        .unwrap_or_default()
        .corrected_payload()?;

    tracing::info!(id = %id, corrected = corrected.is_some(), "Operator replay requested");
    let entry = state
        .dead_letters
        .replay(&id, corrected, state.redeliver.as_ref())
        .await?;
    Ok(Json(entry))
}

/// Body of a discard request.
#[derive(Debug, Deserialize)]
pub struct DiscardRequest {
    /// Why the event is being dropped
    pub reason: String,
}

/// Close an entry without applying it.
pub async fn discard_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DiscardRequest>,
) -> Result<Json<DeadLetterEntry>, AppError> {
    if request.reason.trim().is_empty() {
        return Err(AppError::bad_request("A discard reason is required"));
    }
    let id = DeadLetterId::new(id);
    tracing::info!(id = %id, reason = %request.reason, "Operator discard requested");
    let entry = state.dead_letters.discard(&id, request.reason).await?;
    Ok(Json(entry))
}
