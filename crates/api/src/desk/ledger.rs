//! Message ledger
//!
//! Append-only, totally ordered message history per session. Sequence numbers
//! are computed as `last_seq + 1` from the freshest snapshot and the store
//! rejects duplicates, so a lost race is re-read and retried.

use std::sync::Arc;

use livedesk_shared::{
    ChatSession, ClientId, DeskError, DeskResult, Message, ResponderId, ResponderRef, SenderType,
    SessionId, SessionStatus,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::assistant::BotReply;
use crate::store::{SessionStore, StoreError};

/// Bounded retries for sequence-number races
pub const APPEND_MAX_ATTEMPTS: u32 = 3;

/// A message posted through the public operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub content: String,
    pub sender_type: SenderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_token: Option<String>,
}

impl NewMessage {
    pub fn from_client(
        client_id: ClientId,
        content: impl Into<String>,
        dedup_token: Option<String>,
    ) -> Self {
        Self {
            content: content.into(),
            sender_type: SenderType::Client,
            sender_id: Some(client_id.0),
            dedup_token,
        }
    }

    pub fn from_responder(
        responder_id: ResponderId,
        content: impl Into<String>,
        dedup_token: Option<String>,
    ) -> Self {
        Self {
            content: content.into(),
            sender_type: SenderType::HumanResponder,
            sender_id: Some(responder_id.0),
            dedup_token,
        }
    }
}

/// Result of an append
#[derive(Debug, Clone)]
pub struct Appended {
    pub session: ChatSession,
    pub seq: i64,
    /// The dedup token matched an existing message; nothing was written
    pub duplicate: bool,
}

/// Trim and bound message content
pub fn validate_content(content: &str, max_length: usize) -> DeskResult<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(DeskError::Validation("message content is required".to_string()));
    }
    if trimmed.chars().count() > max_length {
        return Err(DeskError::Validation(format!(
            "message content exceeds {} characters",
            max_length
        )));
    }
    Ok(trimmed.to_string())
}

/// Dedup tokens with this prefix belong to automated replies
pub const BOT_REPLY_TOKEN_PREFIX: &str = "auto-reply:";

fn bot_reply_token(in_reply_to: i64) -> String {
    format!("{}{}", BOT_REPLY_TOKEN_PREFIX, in_reply_to)
}

/// Reject caller-supplied tokens that could shadow an automated reply
pub fn validate_dedup_token(token: Option<&str>) -> DeskResult<()> {
    match token {
        Some(token) if token.starts_with(BOT_REPLY_TOKEN_PREFIX) => Err(DeskError::Validation(
            format!("dedup_token may not start with '{}'", BOT_REPLY_TOKEN_PREFIX),
        )),
        _ => Ok(()),
    }
}

/// Check that the sender may post into this session
pub fn authorize_sender(session: &ChatSession, message: &NewMessage) -> DeskResult<()> {
    if session.status == SessionStatus::Completed {
        return Err(DeskError::session_completed(session.id));
    }

    match message.sender_type {
        SenderType::Client => match message.sender_id {
            Some(id) if id != session.client_id.0 => Err(DeskError::Validation(format!(
                "sender {} is not the client of session {}",
                id, session.id
            ))),
            _ => Ok(()),
        },
        SenderType::HumanResponder => {
            let sender = message.sender_id.map(ResponderId).ok_or_else(|| {
                DeskError::Validation("sender_id is required for responder messages".to_string())
            })?;
            if session.status == SessionStatus::Active
                && session.responder == Some(ResponderRef::Human(sender))
            {
                Ok(())
            } else {
                Err(DeskError::InvalidState(format!(
                    "responder {} is not assigned to session {}",
                    sender, session.id
                )))
            }
        }
        SenderType::AutomatedResponder => Err(DeskError::Validation(
            "automated responder messages cannot be posted directly".to_string(),
        )),
    }
}

/// Whether a client message should trigger an automated reply
pub fn wants_bot_reply(session: &ChatSession, sender_type: SenderType) -> bool {
    sender_type == SenderType::Client
        && match session.status {
            SessionStatus::Waiting => true,
            SessionStatus::Active => session.responder == Some(ResponderRef::Automated),
            SessionStatus::Completed => false,
        }
}

pub struct Ledger {
    store: Arc<dyn SessionStore>,
    max_message_length: usize,
}

impl Ledger {
    pub fn new(store: Arc<dyn SessionStore>, max_message_length: usize) -> Self {
        Self {
            store,
            max_message_length,
        }
    }

    /// Append a public message. The caller holds the session's lock.
    pub async fn append(
        &self,
        session: ChatSession,
        message: NewMessage,
        now: OffsetDateTime,
    ) -> DeskResult<Appended> {
        let content = validate_content(&message.content, self.max_message_length)?;
        validate_dedup_token(message.dedup_token.as_deref())?;
        let entry = Entry {
            sender_type: message.sender_type,
            sender_id: message.sender_id,
            content,
            dedup_token: message.dedup_token.clone(),
        };
        self.append_entry(session, entry, now, |s| authorize_sender(s, &message))
            .await
    }

    /// Append the automated responder's reply to the client message at `in_reply_to`
    pub async fn append_bot_reply(
        &self,
        session: ChatSession,
        reply: BotReply,
        in_reply_to: i64,
        now: OffsetDateTime,
    ) -> DeskResult<Appended> {
        let entry = Entry {
            sender_type: SenderType::AutomatedResponder,
            sender_id: None,
            content: reply.content,
            dedup_token: Some(bot_reply_token(in_reply_to)),
        };
        self.append_entry(session, entry, now, |s| {
            if s.is_open() {
                Ok(())
            } else {
                Err(DeskError::session_completed(s.id))
            }
        })
        .await
    }

    pub async fn mark_read(
        &self,
        session_id: SessionId,
        reader: SenderType,
        up_to_seq: i64,
        now: OffsetDateTime,
    ) -> DeskResult<ChatSession> {
        match self.store.mark_read(session_id, reader, up_to_seq, now).await {
            Ok(session) => Ok(session),
            Err(StoreError::PreconditionFailed(_)) => Err(DeskError::session_completed(session_id)),
            Err(StoreError::NotFound(_)) => Err(DeskError::session_not_found(session_id)),
            Err(err) => Err(err.into()),
        }
    }

    async fn append_entry<F>(
        &self,
        mut session: ChatSession,
        entry: Entry,
        now: OffsetDateTime,
        authorize: F,
    ) -> DeskResult<Appended>
    where
        F: Fn(&ChatSession) -> DeskResult<()>,
    {
        for attempt in 1..=APPEND_MAX_ATTEMPTS {
            if let Some(token) = entry.dedup_token.as_deref() {
                if let Some(existing) = session.find_by_dedup_token(token) {
                    tracing::debug!(
                        session_id = %session.id,
                        seq = existing.seq,
                        "Duplicate message token, skipping append"
                    );
                    let seq = existing.seq;
                    return Ok(Appended {
                        session,
                        seq,
                        duplicate: true,
                    });
                }
            }
            authorize(&session)?;

            let seq = session.next_seq();
            let message = Message {
                seq,
                sender_id: entry.sender_id,
                sender_type: entry.sender_type,
                content: entry.content.clone(),
                sent_at: now,
                read: false,
                dedup_token: entry.dedup_token.clone(),
            };

            match self.store.append_message(session.id, message).await {
                Ok(updated) => {
                    return Ok(Appended {
                        session: updated,
                        seq,
                        duplicate: false,
                    })
                }
                Err(StoreError::Conflict(reason)) => {
                    tracing::debug!(
                        session_id = %session.id,
                        seq,
                        attempt,
                        reason = %reason,
                        "Sequence race lost, re-reading ledger"
                    );
                    session = self.store.get(session.id).await?;
                }
                Err(StoreError::PreconditionFailed(_)) => {
                    return Err(DeskError::session_completed(session.id))
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(DeskError::Conflict(format!(
            "could not assign a sequence number in session {} after {} attempts",
            session.id, APPEND_MAX_ATTEMPTS
        )))
    }
}

struct Entry {
    sender_type: SenderType,
    sender_id: Option<Uuid>,
    content: String,
    dedup_token: Option<String>,
}
