//! HTTP surface of the inventory sync engine.
//!
//! Two groups of routes share one [`AppState`]:
//!
//! - **Query API** for other services: position snapshots, ATP, reservations
//!   and releases
//! - **Operator endpoints** for the dead-letter store: list, inspect, replay
//!   and discard
//!
//! plus `/health` (liveness) and `/ready` (readiness).
//!
//! # Example
//!
//! ```ignore
//! let state = AppState::from_engine(&engine);
//! let app = inventory_sync_web::router(state.clone());
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! state.set_ready(true);
//! axum::serve(listener, app).await?;
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod state;

use axum::{
    Router,
    routing::{get, post},
};

pub use error::AppError;
pub use middleware::{CORRELATION_ID_HEADER, CorrelationId, correlation_id_layer};
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;

/// The full router with state and middleware applied.
pub fn router(state: AppState) -> Router {
    use handlers::{dead_letters, positions};

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route(
            "/api/positions/:location_id/:item_id",
            get(positions::get_position),
        )
        .route(
            "/api/positions/:location_id/:item_id/atp",
            get(positions::get_atp),
        )
        .route(
            "/api/positions/:location_id/:item_id/reservations",
            post(positions::reserve),
        )
        .route(
            "/api/positions/:location_id/:item_id/releases",
            post(positions::release),
        )
        .route("/api/dead-letters", get(dead_letters::list_dead_letters))
        .route("/api/dead-letters/:id", get(dead_letters::get_dead_letter))
        .route(
            "/api/dead-letters/:id/replay",
            post(dead_letters::replay_dead_letter),
        )
        .route(
            "/api/dead-letters/:id/discard",
            post(dead_letters::discard_dead_letter),
        )
        .layer(correlation_id_layer())
        .with_state(state)
}
