//! Postgres-backed session store
//!
//! Conditional `UPDATE ... WHERE` statements implement the patch
//! expectations; appends lock the session row so sequence assignment is
//! serialized across processes, with the `(session_id, seq)` primary key as
//! the backstop.

use std::collections::HashMap;

use async_trait::async_trait;
use livedesk_shared::{
    AssignmentEvent, ChatSession, ClientId, Message, ResponderId, ResponderRef, SenderType,
    SessionFilter, SessionId, SessionSort, SessionStatus,
};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{SessionPatch, SessionStore, StoreError};

const SESSION_COLUMNS: &str = "id, client_id, responder_kind, responder_id, status, priority, \
     subject, metadata, assignments, started_at, updated_at, completed_at";

const MESSAGE_COLUMNS: &str =
    "session_id, seq, sender_id, sender_type, content, sent_at, read, dedup_token";

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    client_id: Uuid,
    responder_kind: Option<String>,
    responder_id: Option<Uuid>,
    status: String,
    priority: String,
    subject: String,
    metadata: serde_json::Value,
    assignments: Json<Vec<AssignmentEvent>>,
    started_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl SessionRow {
    fn into_session(self, messages: Vec<Message>) -> Result<ChatSession, StoreError> {
        Ok(ChatSession {
            id: SessionId(self.id),
            client_id: ClientId(self.client_id),
            responder: decode_responder(self.responder_kind.as_deref(), self.responder_id)?,
            status: self.status.parse().map_err(corrupt)?,
            priority: self.priority.parse().map_err(corrupt)?,
            subject: self.subject,
            metadata: self.metadata,
            started_at: self.started_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            messages,
            assignments: self.assignments.0,
        })
    }
}

#[derive(FromRow)]
struct MessageRow {
    session_id: Uuid,
    seq: i64,
    sender_id: Option<Uuid>,
    sender_type: String,
    content: String,
    sent_at: OffsetDateTime,
    read: bool,
    dedup_token: Option<String>,
}

impl MessageRow {
    fn into_message(self) -> Result<Message, StoreError> {
        Ok(Message {
            seq: self.seq,
            sender_id: self.sender_id,
            sender_type: self.sender_type.parse().map_err(corrupt)?,
            content: self.content,
            sent_at: self.sent_at,
            read: self.read,
            dedup_token: self.dedup_token,
        })
    }
}

fn corrupt(err: livedesk_shared::DeskError) -> StoreError {
    StoreError::Unavailable(format!("corrupt chat row: {}", err))
}

fn encode_responder(responder: Option<ResponderRef>) -> (Option<&'static str>, Option<Uuid>) {
    match responder {
        None => (None, None),
        Some(r @ ResponderRef::Human(id)) => (Some(r.kind_str()), Some(id.0)),
        Some(r @ ResponderRef::Automated) => (Some(r.kind_str()), None),
    }
}

fn decode_responder(
    kind: Option<&str>,
    id: Option<Uuid>,
) -> Result<Option<ResponderRef>, StoreError> {
    match (kind, id) {
        (None, _) => Ok(None),
        (Some("automated"), _) => Ok(Some(ResponderRef::Automated)),
        (Some("human"), Some(id)) => Ok(Some(ResponderRef::Human(ResponderId(id)))),
        (Some(other), _) => Err(StoreError::Unavailable(format!(
            "corrupt chat row: responder kind {:?} with id {:?}",
            other, id
        ))),
    }
}

fn order_clause(sort: SessionSort) -> &'static str {
    match sort {
        SessionSort::StartedAtAsc => "started_at ASC, id ASC",
        SessionSort::StartedAtDesc => "started_at DESC, id ASC",
        SessionSort::UpdatedAtDesc => "updated_at DESC, id ASC",
        SessionSort::QueueOrder => {
            "CASE priority WHEN 'urgent' THEN 3 WHEN 'high' THEN 2 WHEN 'medium' THEN 1 ELSE 0 END DESC, \
             started_at ASC, id ASC"
        }
    }
}

/// Sender types whose messages `reader` can mark as read
fn other_side(reader: SenderType) -> Vec<String> {
    if reader.is_staff_side() {
        vec![SenderType::Client.as_str().to_string()]
    } else {
        vec![
            SenderType::HumanResponder.as_str().to_string(),
            SenderType::AutomatedResponder.as_str().to_string(),
        ]
    }
}

impl PgSessionStore {
    async fn load_messages(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Message>>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM chat_messages WHERE session_id = ANY($1) ORDER BY session_id, seq",
            MESSAGE_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_session: HashMap<Uuid, Vec<Message>> = HashMap::new();
        for row in rows {
            let session_id = row.session_id;
            by_session
                .entry(session_id)
                .or_default()
                .push(row.into_message()?);
        }
        Ok(by_session)
    }

    /// Lock the session row and refuse writes to completed sessions
    async fn lock_open_session(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: SessionId,
    ) -> Result<(), StoreError> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM chat_sessions WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(&mut **tx)
                .await?;

        match status {
            None => Err(StoreError::NotFound(format!("session {}", id))),
            Some((status,)) if status == SessionStatus::Completed.as_str() => Err(
                StoreError::PreconditionFailed(format!("session {} is completed", id)),
            ),
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: ChatSession) -> Result<ChatSession, StoreError> {
        let (kind, responder_id) = encode_responder(session.responder);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO chat_sessions
                (id, client_id, responder_kind, responder_id, status, priority, subject,
                 metadata, assignments, started_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(session.id.0)
        .bind(session.client_id.0)
        .bind(kind)
        .bind(responder_id)
        .bind(session.status.as_str())
        .bind(session.priority.as_str())
        .bind(&session.subject)
        .bind(&session.metadata)
        .bind(Json(&session.assignments))
        .bind(session.started_at)
        .bind(session.updated_at)
        .bind(session.completed_at)
        .execute(&mut *tx)
        .await?;

        for message in &session.messages {
            insert_message(&mut tx, session.id, message).await?;
        }

        tx.commit().await?;
        Ok(session)
    }

    async fn get(&self, id: SessionId) -> Result<ChatSession, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM chat_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| StoreError::NotFound(format!("session {}", id)))?;
        let mut messages = self.load_messages(&[row.id]).await?;
        let ledger = messages.remove(&row.id).unwrap_or_default();
        row.into_session(ledger)
    }

    async fn list(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        limit: usize,
    ) -> Result<Vec<ChatSession>, StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM chat_sessions WHERE TRUE",
            SESSION_COLUMNS
        ));

        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(client_id) = filter.client_id {
            qb.push(" AND client_id = ").push_bind(client_id.0);
        }
        if let Some(responder) = filter.responder {
            let (kind, responder_id) = encode_responder(Some(responder));
            qb.push(" AND ((responder_kind = ")
                .push_bind(kind)
                .push(" AND responder_id IS NOT DISTINCT FROM ")
                .push_bind(responder_id)
                .push(")");
            if filter.include_waiting {
                qb.push(" OR status = 'waiting'");
            }
            qb.push(")");
        }
        qb.push(" ORDER BY ").push(order_clause(sort));
        qb.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows: Vec<SessionRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut messages = self.load_messages(&ids).await?;

        rows.into_iter()
            .map(|row| {
                let ledger = messages.remove(&row.id).unwrap_or_default();
                row.into_session(ledger)
            })
            .collect()
    }

    async fn update(&self, id: SessionId, patch: SessionPatch) -> Result<ChatSession, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE chat_sessions SET updated_at = ");
        qb.push_bind(patch.updated_at);

        if let Some(status) = patch.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(responder) = patch.responder {
            let (kind, responder_id) = encode_responder(responder);
            qb.push(", responder_kind = ")
                .push_bind(kind)
                .push(", responder_id = ")
                .push_bind(responder_id);
        }
        if let Some(completed_at) = patch.completed_at {
            qb.push(", completed_at = ").push_bind(completed_at);
        }
        if let Some(event) = patch.push_assignment.clone() {
            qb.push(", assignments = assignments || jsonb_build_array(")
                .push_bind(Json(event))
                .push("::jsonb)");
        }

        qb.push(" WHERE id = ").push_bind(id.0);
        if let Some(status) = patch.expect_status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(responder) = patch.expect_responder {
            let (kind, responder_id) = encode_responder(responder);
            qb.push(" AND responder_kind IS NOT DISTINCT FROM ")
                .push_bind(kind)
                .push(" AND responder_id IS NOT DISTINCT FROM ")
                .push_bind(responder_id);
        }

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            let exists: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM chat_sessions WHERE id = $1")
                    .bind(id.0)
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(match exists {
                Some(_) => {
                    StoreError::PreconditionFailed(format!("session {} changed concurrently", id))
                }
                None => StoreError::NotFound(format!("session {}", id)),
            });
        }

        self.get(id).await
    }

    async fn append_message(
        &self,
        id: SessionId,
        message: Message,
    ) -> Result<ChatSession, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_open_session(&mut tx, id).await?;
        insert_message(&mut tx, id, &message).await?;

        sqlx::query("UPDATE chat_sessions SET updated_at = $2 WHERE id = $1")
            .bind(id.0)
            .bind(message.sent_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.get(id).await
    }

    async fn mark_read(
        &self,
        id: SessionId,
        reader: SenderType,
        up_to_seq: i64,
        now: OffsetDateTime,
    ) -> Result<ChatSession, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_open_session(&mut tx, id).await?;

        let result = sqlx::query(
            r#"
            UPDATE chat_messages
            SET read = TRUE
            WHERE session_id = $1 AND seq <= $2 AND read = FALSE AND sender_type = ANY($3)
            "#,
        )
        .bind(id.0)
        .bind(up_to_seq)
        .bind(other_side(reader))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            sqlx::query("UPDATE chat_sessions SET updated_at = $2 WHERE id = $1")
                .bind(id.0)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.get(id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn insert_message(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    session_id: SessionId,
    message: &Message,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO chat_messages
            (session_id, seq, sender_id, sender_type, content, sent_at, read, dedup_token)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(session_id.0)
    .bind(message.seq)
    .bind(message.sender_id)
    .bind(message.sender_type.as_str())
    .bind(&message.content)
    .bind(message.sent_at)
    .bind(message.read)
    .bind(message.dedup_token.as_deref())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use livedesk_shared::Priority;

    #[test]
    fn test_responder_columns_round_trip() {
        let human = ResponderRef::Human(ResponderId::new());
        for responder in [None, Some(ResponderRef::Automated), Some(human)] {
            let (kind, id) = encode_responder(responder);
            assert_eq!(decode_responder(kind, id).unwrap(), responder);
        }
        assert!(decode_responder(Some("human"), None).is_err());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_pg_store_append_and_cas() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = livedesk_shared::create_pool(&url, 2).await.unwrap();
        livedesk_shared::run_migrations(&pool).await.unwrap();
        let store = PgSessionStore::new(pool);

        let session = store
            .create(ChatSession::new(
                ClientId::new(),
                "pg smoke test",
                Priority::Low,
                serde_json::json!({}),
                OffsetDateTime::now_utc(),
            ))
            .await
            .unwrap();

        let message = Message {
            seq: 1,
            sender_id: None,
            sender_type: SenderType::Client,
            content: "hi".into(),
            sent_at: OffsetDateTime::now_utc(),
            read: false,
            dedup_token: Some("pg-1".into()),
        };
        store.append_message(session.id, message.clone()).await.unwrap();
        let dup = store.append_message(session.id, message).await.unwrap_err();
        assert!(matches!(dup, StoreError::Conflict(_)));

        let mut patch = SessionPatch::new(OffsetDateTime::now_utc());
        patch.status = Some(SessionStatus::Active);
        patch.responder = Some(Some(ResponderRef::Automated));
        patch.expect_status = Some(SessionStatus::Waiting);
        store.update(session.id, patch.clone()).await.unwrap();
        let lost = store.update(session.id, patch).await.unwrap_err();
        assert!(matches!(lost, StoreError::PreconditionFailed(_)));
    }
}
