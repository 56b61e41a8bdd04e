//! Query API over inventory positions.
//!
//! ```text
//! GET  /api/positions/:location_id/:item_id
//! GET  /api/positions/:location_id/:item_id/atp
//! POST /api/positions/:location_id/:item_id/reservations
//! POST /api/positions/:location_id/:item_id/releases
//! ```

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use inventory_sync_core::event::EventId;
use inventory_sync_core::position::{InventoryPosition, PositionKey};
use inventory_sync_runtime::{RejectionReason, ReservationOutcome};
use serde::{Deserialize, Serialize};

fn position_key(location_id: String, item_id: String) -> Result<PositionKey, AppError> {
    if location_id.trim().is_empty() || item_id.trim().is_empty() {
        return Err(AppError::bad_request("locationId and itemId must not be empty"));
    }
    Ok(PositionKey::new(location_id, item_id))
}

/// Current snapshot of a position. Unknown keys read as all zeros.
pub async fn get_position(
    State(state): State<AppState>,
    Path((location_id, item_id)): Path<(String, String)>,
) -> Result<Json<InventoryPosition>, AppError> {
    let key = position_key(location_id, item_id)?;
    Ok(Json(state.availability.position(&key).await))
}

/// ATP response body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtpResponse {
    /// Location identifier
    pub location_id: String,
    /// Item identifier
    pub item_id: String,
    /// Units that can be promised right now
    pub atp: u64,
}

/// Available-to-promise for a position.
pub async fn get_atp(
    State(state): State<AppState>,
    Path((location_id, item_id)): Path<(String, String)>,
) -> Result<Json<AtpResponse>, AppError> {
    let key = position_key(location_id, item_id)?;
    let atp = state.availability.compute_atp(&key).await;
    Ok(Json(AtpResponse {
        location_id: key.location_id,
        item_id: key.item_id,
        atp,
    }))
}

/// Body of a reservation or release.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantityRequest {
    /// Units to reserve or release
    pub qty: u64,
    /// Caller-chosen ID; resending the same ID does not double count
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Reservation result.
///
/// Serialized with `status` set to `accepted` or `rejected`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReservationResponse {
    /// Units were allocated.
    Accepted {
        /// Caller-facing ID of the reservation
        #[serde(rename = "reservationId")]
        reservation_id: String,
        /// Position after the allocation
        position: InventoryPosition,
    },
    /// Nothing was allocated.
    Rejected {
        /// Human-readable reason
        message: String,
        /// Units asked for
        requested: u64,
        /// ATP at the moment of the check, when that was the reason
        available: Option<u64>,
        /// Position at the moment of the check
        position: InventoryPosition,
    },
}

impl IntoResponse for ReservationResponse {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Accepted { .. } => StatusCode::OK,
            Self::Rejected { .. } => StatusCode::CONFLICT,
        };
        (status, Json(self)).into_response()
    }
}

impl From<ReservationOutcome> for ReservationResponse {
    fn from(outcome: ReservationOutcome) -> Self {
        match outcome {
            ReservationOutcome::Accepted {
                reservation_id,
                position,
            } => Self::Accepted {
                reservation_id: reservation_id.to_string(),
                position,
            },
            ReservationOutcome::Rejected { reason, position } => {
                let (requested, available) = match reason {
                    RejectionReason::InsufficientAvailability {
                        requested,
                        available,
                    } => (requested, Some(available)),
                    RejectionReason::ExceedsSupply { requested, .. }
                    | RejectionReason::InvalidQuantity { requested }
                    | RejectionReason::ConflictingRequestId { requested } => (requested, None),
                };
                Self::Rejected {
                    message: reason.to_string(),
                    requested,
                    available,
                    position,
                }
            },
        }
    }
}

/// Reserve units. `409 Conflict` when there is not enough ATP.
pub async fn reserve(
    State(state): State<AppState>,
    Path((location_id, item_id)): Path<(String, String)>,
    Json(request): Json<QuantityRequest>,
) -> Result<ReservationResponse, AppError> {
    let key = position_key(location_id, item_id)?;
    let outcome = match request.request_id {
        Some(id) => {
            state
                .availability
                .reserve_with_id(EventId::new(id), &key, request.qty)
                .await?
        },
        None => state.availability.reserve(&key, request.qty).await?,
    };
    Ok(outcome.into())
}

/// Release acknowledgement.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    /// Position after the release
    pub position: InventoryPosition,
    /// True when more was released than was allocated
    pub clamped: bool,
}

/// Release previously reserved units.
pub async fn release(
    State(state): State<AppState>,
    Path((location_id, item_id)): Path<(String, String)>,
    Json(request): Json<QuantityRequest>,
) -> Result<Json<ReleaseResponse>, AppError> {
    let key = position_key(location_id, item_id)?;
    let ack = match request.request_id {
        Some(id) => {
            state
                .availability
                .release_with_id(EventId::new(id), &key, request.qty)
                .await?
        },
        None => state.availability.release(&key, request.qty).await?,
    };
    Ok(Json(ReleaseResponse {
        position: ack.position,
        clamped: ack.clamped,
    }))
}
