//! In-memory session store
//!
//! Used when no `DATABASE_URL` is configured and by the test suite. All
//! checks and writes for one call happen under a single write lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use livedesk_shared::{
    ChatSession, Message, SenderType, SessionFilter, SessionId, SessionSort, SessionStatus,
};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::{SessionPatch, SessionStore, StoreError};

#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, ChatSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: ChatSession) -> Result<ChatSession, StoreError> {
        let mut sessions = self.sessions.write().await;

        if session.is_open() {
            let duplicate = sessions
                .values()
                .any(|s| s.client_id == session.client_id && s.is_open());
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "client {} already has an open session",
                    session.client_id
                )));
            }
        }
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!("session {} exists", session.id)));
        }

        sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get(&self, id: SessionId) -> Result<ChatSession, StoreError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))
    }

    async fn list(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        limit: usize,
    ) -> Result<Vec<ChatSession>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut matched: Vec<ChatSession> = sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| sort.compare(a, b).then_with(|| a.id.cmp(&b.id)));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn update(&self, id: SessionId, patch: SessionPatch) -> Result<ChatSession, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))?;

        if !patch.preconditions_hold(session) {
            return Err(StoreError::PreconditionFailed(format!(
                "session {} changed concurrently (now {} / {:?})",
                id,
                session.status.as_str(),
                session.responder
            )));
        }

        let mut updated = session.clone();
        patch.apply(&mut updated);
        updated
            .check_invariants()
            .map_err(StoreError::PreconditionFailed)?;

        *session = updated.clone();
        Ok(updated)
    }

    async fn append_message(
        &self,
        id: SessionId,
        message: Message,
    ) -> Result<ChatSession, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))?;

        if session.status == SessionStatus::Completed {
            return Err(StoreError::PreconditionFailed(format!(
                "session {} is completed",
                id
            )));
        }
        if session.messages.iter().any(|m| m.seq == message.seq) {
            return Err(StoreError::Conflict(format!(
                "session {} already has seq {}",
                id, message.seq
            )));
        }
        if let Some(token) = message.dedup_token.as_deref() {
            if session.find_by_dedup_token(token).is_some() {
                return Err(StoreError::Conflict(format!(
                    "session {} already has dedup token {}",
                    id, token
                )));
            }
        }
        if message.seq <= session.last_seq() {
            return Err(StoreError::Conflict(format!(
                "seq {} is behind the ledger head {}",
                message.seq,
                session.last_seq()
            )));
        }

        session.updated_at = message.sent_at;
        session.messages.push(message);
        Ok(session.clone())
    }

    async fn mark_read(
        &self,
        id: SessionId,
        reader: SenderType,
        up_to_seq: i64,
        now: OffsetDateTime,
    ) -> Result<ChatSession, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))?;

        if session.status == SessionStatus::Completed {
            return Err(StoreError::PreconditionFailed(format!(
                "session {} is completed",
                id
            )));
        }

        let mut changed = false;
        for message in session.messages.iter_mut() {
            if message.seq <= up_to_seq
                && !message.read
                && message.sender_type.is_staff_side() != reader.is_staff_side()
            {
                message.read = true;
                changed = true;
            }
        }
        if changed {
            session.updated_at = now;
        }
        Ok(session.clone())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use livedesk_shared::{ClientId, Priority, ResponderRef};

    fn new_session(client_id: ClientId) -> ChatSession {
        ChatSession::new(
            client_id,
            "Refund",
            Priority::High,
            serde_json::json!({"page": "/billing"}),
            OffsetDateTime::now_utc(),
        )
    }

    fn client_message(seq: i64, token: &str) -> Message {
        Message {
            seq,
            sender_id: None,
            sender_type: SenderType::Client,
            content: "hello".to_string(),
            sent_at: OffsetDateTime::now_utc(),
            read: false,
            dedup_token: Some(token.to_string()),
        }
    }

    #[tokio::test]
    async fn test_one_open_session_per_client() {
        let store = MemorySessionStore::new();
        let client = ClientId::new();
        store.create(new_session(client)).await.unwrap();

        let err = store.create(new_session(client)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // A different client is unaffected
        store.create(new_session(ClientId::new())).await.unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_append_rejects_duplicate_seq_and_token() {
        let store = MemorySessionStore::new();
        let session = store.create(new_session(ClientId::new())).await.unwrap();

        store
            .append_message(session.id, client_message(1, "a"))
            .await
            .unwrap();
        let dup_seq = store
            .append_message(session.id, client_message(1, "b"))
            .await
            .unwrap_err();
        assert!(matches!(dup_seq, StoreError::Conflict(_)));

        let dup_token = store
            .append_message(session.id, client_message(2, "a"))
            .await
            .unwrap_err();
        assert!(matches!(dup_token, StoreError::Conflict(_)));

        let stored = store.get(session.id).await.unwrap();
        assert_eq!(stored.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_update_enforces_cas() {
        let store = MemorySessionStore::new();
        let session = store.create(new_session(ClientId::new())).await.unwrap();

        let mut patch = SessionPatch::new(OffsetDateTime::now_utc());
        patch.status = Some(SessionStatus::Active);
        patch.responder = Some(Some(ResponderRef::Automated));
        patch.expect_status = Some(SessionStatus::Waiting);

        store.update(session.id, patch.clone()).await.unwrap();
        let err = store.update(session.id, patch).await.unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_update_refuses_to_break_invariants() {
        let store = MemorySessionStore::new();
        let session = store.create(new_session(ClientId::new())).await.unwrap();

        let mut patch = SessionPatch::new(OffsetDateTime::now_utc());
        patch.status = Some(SessionStatus::Active);
        let err = store.update(session.id, patch).await.unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));
        assert_eq!(
            store.get(session.id).await.unwrap().status,
            SessionStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_mark_read_only_touches_other_side() {
        let store = MemorySessionStore::new();
        let session = store.create(new_session(ClientId::new())).await.unwrap();
        store
            .append_message(session.id, client_message(1, "a"))
            .await
            .unwrap();
        let mut reply = client_message(2, "b");
        reply.sender_type = SenderType::AutomatedResponder;
        store.append_message(session.id, reply).await.unwrap();

        let updated = store
            .mark_read(session.id, SenderType::Client, 2, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(!updated.messages[0].read);
        assert!(updated.messages[1].read);
    }
}
