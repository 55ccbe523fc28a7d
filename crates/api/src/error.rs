//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use livedesk_shared::DeskError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),

    // Session lifecycle errors
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("No responder capacity: {0}")]
    NoCapacity(String),

    // Internal errors
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Lifecycle
            ApiError::InvalidState(msg) => (StatusCode::CONFLICT, "INVALID_STATE", msg.clone()),
            ApiError::NoCapacity(msg) => (StatusCode::CONFLICT, "NO_CAPACITY", msg.clone()),

            // Internal
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg.clone()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<DeskError> for ApiError {
    fn from(err: DeskError) -> Self {
        match err {
            DeskError::NotFound(msg) => ApiError::NotFound(msg),
            DeskError::Validation(msg) => ApiError::Validation(msg),
            DeskError::InvalidState(msg) => ApiError::InvalidState(msg),
            DeskError::Capacity(msg) => ApiError::NoCapacity(msg),
            DeskError::Conflict(msg) => ApiError::Conflict(msg),
            DeskError::ServiceUnavailable(msg) => {
                tracing::warn!(error = %msg, "Dependency unavailable");
                ApiError::ServiceUnavailable(msg)
            }
            DeskError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desk_errors_map_to_status_codes() {
        let cases = [
            (DeskError::NotFound("session".into()), StatusCode::NOT_FOUND),
            (DeskError::Validation("empty".into()), StatusCode::BAD_REQUEST),
            (DeskError::InvalidState("completed".into()), StatusCode::CONFLICT),
            (DeskError::Capacity("full".into()), StatusCode::CONFLICT),
            (DeskError::ServiceUnavailable("store".into()), StatusCode::SERVICE_UNAVAILABLE),
            (DeskError::Internal("bug".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
