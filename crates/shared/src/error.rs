//! Error types for LiveDesk

use thiserror::Error;

/// Core error taxonomy for session lifecycle operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeskError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Mutation attempted against a session whose status does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No responder with spare capacity could take the session
    #[error("No responder capacity: {0}")]
    Capacity(String),

    /// Store or automated responder unreachable
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Lost an optimistic concurrency race; callers re-read and retry
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeskError {
    pub fn session_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("session {}", id))
    }

    pub fn responder_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("responder {}", id))
    }

    pub fn session_completed(id: impl std::fmt::Display) -> Self {
        Self::InvalidState(format!("session {} is completed", id))
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_) | Self::Conflict(_))
    }
}

/// Result type alias for desk operations
pub type DeskResult<T> = Result<T, DeskError>;
