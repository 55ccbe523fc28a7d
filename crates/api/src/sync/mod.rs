//! Viewer synchronization
//!
//! A viewer (a client looking at their session, or a responder looking at
//! their queue) keeps a local copy of the sessions it cares about by polling
//! a [`SessionSource`] on a fixed interval. Every successful poll replaces
//! the local copy wholesale.

pub mod http_source;
pub mod poller;

use async_trait::async_trait;
use livedesk_shared::{
    ChatSession, ClientId, DeskError, ResponderId, SessionFilter, SessionId, SessionSort,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::desk::{ChatService, NewMessage};

pub use http_source::HttpSessionSource;
pub use poller::{
    Connectivity, PendingMessage, StopReason, SyncConfig, SyncHandle, SyncLoop, TickOutcome,
    ViewerSnapshot,
};

/// Upper bound on sessions fetched for one staff queue
pub const STAFF_QUEUE_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ViewerRole {
    Client {
        client_id: ClientId,
        session_id: SessionId,
    },
    Staff {
        responder_id: ResponderId,
    },
}

/// Who is looking, passed explicitly into every loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerContext {
    pub viewer_id: Uuid,
    pub role: ViewerRole,
}

impl ViewerContext {
    pub fn client(client_id: ClientId, session_id: SessionId) -> Self {
        Self {
            viewer_id: client_id.0,
            role: ViewerRole::Client {
                client_id,
                session_id,
            },
        }
    }

    pub fn staff(responder_id: ResponderId) -> Self {
        Self {
            viewer_id: responder_id.0,
            role: ViewerRole::Staff { responder_id },
        }
    }

    /// The session a client viewer is scoped to
    pub fn session_id(&self) -> Option<SessionId> {
        match self.role {
            ViewerRole::Client { session_id, .. } => Some(session_id),
            ViewerRole::Staff { .. } => None,
        }
    }

    /// Build an outgoing message attributed to this viewer
    pub fn compose(&self, content: impl Into<String>, dedup_token: String) -> NewMessage {
        match self.role {
            ViewerRole::Client { client_id, .. } => {
                NewMessage::from_client(client_id, content, Some(dedup_token))
            }
            ViewerRole::Staff { responder_id } => {
                NewMessage::from_responder(responder_id, content, Some(dedup_token))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request rejected with {status} {code}: {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    #[error(transparent)]
    Desk(#[from] DeskError),
}

impl SyncError {
    /// Whether the same request may succeed if sent again
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transport(_) => true,
            SyncError::Rejected { status, code, .. } => {
                *status >= 500 || *status == 429 || code == "CONFLICT"
            }
            SyncError::Desk(err) => err.is_retryable(),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

/// Where a viewer's snapshots come from
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn fetch_session(&self, id: SessionId) -> Result<ChatSession, SyncError>;

    async fn fetch_sessions(&self, filter: &SessionFilter) -> Result<Vec<ChatSession>, SyncError>;

    async fn post_message(
        &self,
        id: SessionId,
        message: NewMessage,
    ) -> Result<ChatSession, SyncError>;
}

#[async_trait]
impl SessionSource for ChatService {
    async fn fetch_session(&self, id: SessionId) -> Result<ChatSession, SyncError> {
        Ok(self.poll_session(id).await?)
    }

    async fn fetch_sessions(&self, filter: &SessionFilter) -> Result<Vec<ChatSession>, SyncError> {
        Ok(self
            .poll_sessions(filter, SessionSort::StartedAtDesc, STAFF_QUEUE_LIMIT)
            .await?)
    }

    async fn post_message(
        &self,
        id: SessionId,
        message: NewMessage,
    ) -> Result<ChatSession, SyncError> {
        Ok(ChatService::post_message(self, id, message).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livedesk_shared::SenderType;

    #[test]
    fn test_compose_attributes_sender() {
        let client = ClientId::new();
        let viewer = ViewerContext::client(client, SessionId::new());
        let message = viewer.compose("hi", "t-1".to_string());
        assert_eq!(message.sender_type, SenderType::Client);
        assert_eq!(message.sender_id, Some(client.0));
        assert_eq!(message.dedup_token.as_deref(), Some("t-1"));

        let staff = ViewerContext::staff(ResponderId::new());
        assert_eq!(
            staff.compose("hello", "t-2".to_string()).sender_type,
            SenderType::HumanResponder
        );
        assert!(staff.session_id().is_none());
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Transport("reset".into()).is_transient());
        assert!(SyncError::Rejected {
            status: 503,
            code: "SERVICE_UNAVAILABLE".into(),
            message: "down".into()
        }
        .is_transient());
        assert!(!SyncError::Rejected {
            status: 409,
            code: "INVALID_STATE".into(),
            message: "completed".into()
        }
        .is_transient());
        assert!(!SyncError::Desk(DeskError::Validation("empty".into())).is_transient());
    }
}
