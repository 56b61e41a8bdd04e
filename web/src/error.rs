//! Error types for web handlers.
//!
//! [`AppError`] is the bridge between engine errors and HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use inventory_sync_core::dead_letter::DeadLetterError;
use inventory_sync_core::store::StoreError;
use serde::Serialize;
use std::fmt;

/// Application error type for web handlers.
///
/// # Examples
///
/// ```
/// use axum::http::StatusCode;
/// use inventory_sync_web::AppError;
///
/// let err = AppError::not_found("Dead-letter entry", "E7");
/// assert_eq!(err.status(), StatusCode::NOT_FOUND);
/// assert_eq!(err.code(), "NOT_FOUND");
/// ```
#[derive(Debug)]
pub struct AppError {
    /// HTTP status code
    status: StatusCode,
    /// Error message (user-facing)
    message: String,
    /// Error code (for client error handling)
    code: String,
    /// Internal error (for logging, not exposed to client)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub const fn new(status: StatusCode, message: String, code: String) -> Self {
        Self {
            status,
            message,
            code,
            source: None,
        }
    }

    /// Attach the underlying error.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// HTTP status of the response.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            message.into(),
            "BAD_REQUEST".to_string(),
        )
    }

    /// Create a 404 Not Found error.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} with id {id} not found"),
            "NOT_FOUND".to_string(),
        )
    }

    /// Create a 409 Conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message.into(), "CONFLICT".to_string())
    }

    /// Create a 422 Unprocessable Entity error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            message.into(),
            "VALIDATION_ERROR".to_string(),
        )
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message.into(),
            "INTERNAL_SERVER_ERROR".to_string(),
        )
    }

    /// Create a 503 Service Unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            message.into(),
            "SERVICE_UNAVAILABLE".to_string(),
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            match &self.source {
                Some(source) => tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    error = %source,
                    "Request failed"
                ),
                None => tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    "Request failed"
                ),
            }
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Rejected(validation) => Self::validation(validation.to_string()),
            e @ (StoreError::Unavailable(_) | StoreError::Timeout { .. }) => {
                Self::unavailable(e.to_string()).with_source(e.into())
            },
        }
    }
}

impl From<DeadLetterError> for AppError {
    fn from(err: DeadLetterError) -> Self {
        match err {
            DeadLetterError::NotFound(id) => Self::not_found("Dead-letter entry", id),
            e @ DeadLetterError::InvalidState { .. } => Self::conflict(e.to_string()),
            e @ DeadLetterError::Storage(_) => {
                Self::unavailable("Dead-letter storage unavailable").with_source(e.into())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inventory_sync_core::dead_letter::DeadLetterStatus;
    use inventory_sync_core::event::ValidationError;

    #[test]
    fn test_error_display() {
        let err = AppError::bad_request("Invalid input");
        assert_eq!(err.to_string(), "[BAD_REQUEST] Invalid input");
    }

    #[test]
    fn test_not_found() {
        let err = AppError::not_found("Dead-letter entry", "E1");
        assert_eq!(
            err.to_string(),
            "[NOT_FOUND] Dead-letter entry with id E1 not found"
        );
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_store_errors_map_by_class() {
        let transient = AppError::from(StoreError::Timeout {
            key: "store-1/sku-1".to_string(),
        });
        assert_eq!(transient.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(transient.source.is_some());

        let rejected = AppError::from(StoreError::Rejected(ValidationError::MissingField(
            "locationId",
        )));
        assert_eq!(rejected.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(rejected.code, "VALIDATION_ERROR");
    }

    #[test]
    fn test_dead_letter_errors_map_by_class() {
        let missing = AppError::from(DeadLetterError::NotFound("E1".to_string()));
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let closed = AppError::from(DeadLetterError::InvalidState {
            id: "E1".to_string(),
            status: DeadLetterStatus::Resolved,
        });
        assert_eq!(closed.status, StatusCode::CONFLICT);

        let storage = AppError::from(DeadLetterError::Storage("connection refused".to_string()));
        assert_eq!(storage.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!storage.message.contains("connection refused"));
    }
}
