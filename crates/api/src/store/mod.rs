//! Session store seam
//!
//! The engine only talks to durable storage through [`SessionStore`]. Every
//! status or responder change is expressed as a [`SessionPatch`] carrying
//! compare-and-swap expectations, so two processes racing on the same
//! session cannot both win.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use livedesk_shared::{
    AssignmentEvent, ChatSession, DeskError, Message, ResponderRef, SenderType, SessionFilter,
    SessionId, SessionSort, SessionStatus,
};
use time::OffsetDateTime;

pub use memory::MemorySessionStore;
pub use postgres::PgSessionStore;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Unique constraint hit (duplicate sequence number, dedup token, or open session)
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Compare-and-swap expectation did not hold
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // PostgreSQL unique violation
                if db_err.code().as_deref() == Some("23505") {
                    return StoreError::Conflict(db_err.message().to_string());
                }
                tracing::error!(error = %db_err, "Session store database error");
                StoreError::Unavailable(db_err.to_string())
            }
            other => {
                tracing::error!(error = %other, "Session store unavailable");
                StoreError::Unavailable(other.to_string())
            }
        }
    }
}

impl From<StoreError> for DeskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => DeskError::NotFound(what),
            StoreError::Conflict(msg) | StoreError::PreconditionFailed(msg) => {
                DeskError::Conflict(msg)
            }
            StoreError::Unavailable(msg) => DeskError::ServiceUnavailable(msg),
        }
    }
}

/// Partial update applied atomically by the store.
///
/// `expect_*` fields are checked against the stored record before anything
/// is written; a mismatch yields [`StoreError::PreconditionFailed`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    /// `Some(None)` clears the responder
    pub responder: Option<Option<ResponderRef>>,
    pub completed_at: Option<OffsetDateTime>,
    pub push_assignment: Option<AssignmentEvent>,
    pub expect_status: Option<SessionStatus>,
    pub expect_responder: Option<Option<ResponderRef>>,
    pub updated_at: OffsetDateTime,
}

impl SessionPatch {
    pub fn new(updated_at: OffsetDateTime) -> Self {
        Self {
            status: None,
            responder: None,
            completed_at: None,
            push_assignment: None,
            expect_status: None,
            expect_responder: None,
            updated_at,
        }
    }

    pub fn preconditions_hold(&self, session: &ChatSession) -> bool {
        if let Some(status) = self.expect_status {
            if session.status != status {
                return false;
            }
        }
        if let Some(responder) = self.expect_responder {
            if session.responder != responder {
                return false;
            }
        }
        true
    }

    pub fn apply(&self, session: &mut ChatSession) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(responder) = self.responder {
            session.responder = responder;
        }
        if let Some(completed_at) = self.completed_at {
            session.completed_at = Some(completed_at);
        }
        if let Some(event) = &self.push_assignment {
            session.assignments.push(event.clone());
        }
        session.updated_at = self.updated_at;
    }
}

/// Durable record storage for sessions and their message ledgers
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails with `Conflict` if the client already has an open session.
    async fn create(&self, session: ChatSession) -> Result<ChatSession, StoreError>;

    async fn get(&self, id: SessionId) -> Result<ChatSession, StoreError>;

    async fn list(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        limit: usize,
    ) -> Result<Vec<ChatSession>, StoreError>;

    /// Apply a patch if its expectations hold, returning the updated record
    async fn update(&self, id: SessionId, patch: SessionPatch) -> Result<ChatSession, StoreError>;

    /// Append one message.
    ///
    /// Fails with `Conflict` when `(session, seq)` or `(session, dedup_token)`
    /// already exists and with `PreconditionFailed` when the session is completed.
    async fn append_message(&self, id: SessionId, message: Message)
        -> Result<ChatSession, StoreError>;

    /// Flag messages written by the side opposite `reader` with `seq <= up_to_seq` as read
    async fn mark_read(
        &self,
        id: SessionId,
        reader: SenderType,
        up_to_seq: i64,
        now: OffsetDateTime,
    ) -> Result<ChatSession, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
