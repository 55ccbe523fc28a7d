//! Chat desk engine
//!
//! [`ChatService`] is the only entry point that mutates sessions. Every
//! mutation of one session runs under that session's in-process lock and is
//! committed with a compare-and-swap patch, so concurrent viewers and other
//! processes sharing the store cannot interleave read-modify-write cycles.

pub mod ledger;
pub mod lifecycle;
pub mod locks;
pub mod routing;
pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use livedesk_shared::{
    AssignmentReason, AssignmentStatus, ChatSession, ClientId, DeskError, DeskResult, Priority,
    ResponderAvailability, ResponderId, ResponderRef, SenderType, SessionFilter, SessionId,
    SessionSort, SessionStatus,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::assistant::FallbackAssistant;
use crate::directory::{AvailabilityUpdate, ResponderDirectory, ResponderFilter};
use crate::store::{SessionStore, StoreError};

pub use ledger::{Appended, Ledger, NewMessage};
pub use lifecycle::Transition;
pub use locks::KeyedLocks;
pub use routing::{rank_candidates, AssignmentPolicy, Reservation};
pub use sweeper::{
    spawn_embedded_sweeper, stop_embedded_sweeper, sweep_waiting_sessions, SweepReport,
};

/// Engine-facing subset of the configuration
#[derive(Debug, Clone)]
pub struct DeskSettings {
    /// How long a session may wait for a human before the automated responder takes it
    pub wait_threshold: Duration,
    pub assign_max_attempts: u32,
    pub bot_fallback_enabled: bool,
    pub max_message_length: usize,
    pub max_subject_length: usize,
    /// Applied load-change tokens older than this are forgotten
    pub operation_retention: Duration,
}

impl Default for DeskSettings {
    fn default() -> Self {
        Self {
            wait_threshold: Duration::from_secs(120),
            assign_max_attempts: 3,
            bot_fallback_enabled: true,
            max_message_length: 50_000,
            max_subject_length: 500,
            operation_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Request to open a support session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSession {
    pub client_id: ClientId,
    pub subject: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedSession {
    pub session: ChatSession,
    pub assignment_status: AssignmentStatus,
    /// The client already had an open session and got it back unchanged
    pub reused: bool,
}

impl StartedSession {
    fn new(session: ChatSession, reused: bool) -> Self {
        Self {
            assignment_status: AssignmentStatus::from(&session),
            session,
            reused,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderWorkload {
    #[serde(flatten)]
    pub responder: ResponderAvailability,
    pub spare: u32,
    pub eligible: bool,
}

impl From<ResponderAvailability> for ResponderWorkload {
    fn from(responder: ResponderAvailability) -> Self {
        Self {
            spare: responder.capacity.saturating_sub(responder.load),
            eligible: responder.is_eligible(),
            responder,
        }
    }
}

pub struct ChatService {
    store: Arc<dyn SessionStore>,
    directory: Arc<dyn ResponderDirectory>,
    ledger: Ledger,
    policy: AssignmentPolicy,
    assistant: Option<FallbackAssistant>,
    settings: DeskSettings,
    session_locks: KeyedLocks<SessionId>,
    client_locks: KeyedLocks<ClientId>,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn ResponderDirectory>,
        assistant: Option<FallbackAssistant>,
        settings: DeskSettings,
    ) -> Self {
        Self {
            ledger: Ledger::new(store.clone(), settings.max_message_length),
            policy: AssignmentPolicy::new(directory.clone(), settings.assign_max_attempts),
            store,
            directory,
            assistant,
            settings,
            session_locks: KeyedLocks::new(),
            client_locks: KeyedLocks::new(),
        }
    }

    pub fn settings(&self) -> &DeskSettings {
        &self.settings
    }

    /// Open a session for the client, or return the one already open
    pub async fn start_session(&self, request: StartSession) -> DeskResult<StartedSession> {
        let subject = self.validate_subject(&request.subject)?;
        let client_id = request.client_id;
        let _client_guard = self.client_locks.lock(&client_id).await;

        if let Some(existing) = self.find_open(client_id).await? {
            tracing::debug!(session_id = %existing.id, client_id = %client_id, "Reusing open session");
            return Ok(StartedSession::new(existing, true));
        }

        let now = OffsetDateTime::now_utc();
        let metadata = if request.metadata.is_null() {
            serde_json::json!({})
        } else {
            request.metadata
        };
        let draft = ChatSession::new(client_id, subject, request.priority, metadata, now);

        let session = match self.store.create(draft).await {
            Ok(session) => session,
            Err(StoreError::Conflict(_)) => {
                // Another process opened one between our lookup and insert
                return match self.find_open(client_id).await? {
                    Some(existing) => Ok(StartedSession::new(existing, true)),
                    None => Err(DeskError::Conflict(format!(
                        "client {} session creation raced, retry",
                        client_id
                    ))),
                };
            }
            Err(err) => return Err(err.into()),
        };

        tracing::info!(
            session_id = %session.id,
            client_id = %client_id,
            priority = session.priority.as_str(),
            "Chat session started"
        );

        let _session_guard = self.session_locks.lock(&session.id).await;
        let session = self.route_waiting(session, now).await?;
        Ok(StartedSession::new(session, false))
    }

    /// Append a client or responder message, with an automated reply when due
    pub async fn post_message(
        &self,
        session_id: SessionId,
        message: NewMessage,
    ) -> DeskResult<ChatSession> {
        let _guard = self.session_locks.lock(&session_id).await;
        let session = self.load(session_id).await?;
        let sender_type = message.sender_type;

        let appended = self
            .ledger
            .append(session, message, OffsetDateTime::now_utc())
            .await?;
        tracing::debug!(
            session_id = %session_id,
            seq = appended.seq,
            sender_type = sender_type.as_str(),
            duplicate = appended.duplicate,
            "Message appended"
        );

        if appended.duplicate
            || !self.settings.bot_fallback_enabled
            || !ledger::wants_bot_reply(&appended.session, sender_type)
        {
            return Ok(appended.session);
        }
        let Some(assistant) = &self.assistant else {
            return Ok(appended.session);
        };

        let reply = match assistant
            .reply(session_id, &appended.session.messages)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %err,
                    "Automated reply omitted"
                );
                return Ok(appended.session);
            }
        };

        match self
            .ledger
            .append_bot_reply(
                appended.session.clone(),
                reply,
                appended.seq,
                OffsetDateTime::now_utc(),
            )
            .await
        {
            Ok(with_reply) => Ok(with_reply.session),
            Err(err) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %err,
                    "Automated reply could not be stored"
                );
                Ok(appended.session)
            }
        }
    }

    /// Authoritative snapshot of one session; a waiting session gets a routing pass first
    pub async fn poll_session(&self, session_id: SessionId) -> DeskResult<ChatSession> {
        self.reconcile_waiting(session_id).await
    }

    /// Snapshot of every session matching `filter`. Read-only.
    pub async fn poll_sessions(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        limit: usize,
    ) -> DeskResult<Vec<ChatSession>> {
        Ok(self.store.list(filter, sort, limit).await?)
    }

    /// Try to route a waiting session, falling back to the automated
    /// responder once the wait threshold has passed
    pub async fn reconcile_waiting(&self, session_id: SessionId) -> DeskResult<ChatSession> {
        let _guard = self.session_locks.lock(&session_id).await;
        let session = self.load(session_id).await?;
        self.route_waiting(session, OffsetDateTime::now_utc()).await
    }

    /// A staff responder takes a session. Claiming a bot-handled session escalates it.
    pub async fn claim_session(
        &self,
        session_id: SessionId,
        responder_id: ResponderId,
    ) -> DeskResult<ChatSession> {
        let _guard = self.session_locks.lock(&session_id).await;
        let session = self.load(session_id).await?;
        let now = OffsetDateTime::now_utc();

        let (transition, reservation) = match (session.status, session.responder) {
            (SessionStatus::Completed, _) => return Err(DeskError::session_completed(session_id)),
            (SessionStatus::Active, Some(ResponderRef::Human(current))) if current == responder_id => {
                return Ok(session)
            }
            (SessionStatus::Active, Some(ResponderRef::Automated)) => {
                let reservation = self
                    .policy
                    .reserve_transfer(&session, ResponderRef::Automated, Some(responder_id), now)
                    .await?;
                let transition = Transition::Transfer {
                    from: ResponderRef::Automated,
                    to: responder_id,
                    reason: AssignmentReason::Claimed,
                };
                (transition, reservation)
            }
            (SessionStatus::Active, _) => {
                return Err(DeskError::InvalidState(format!(
                    "session {} is already claimed",
                    session_id
                )))
            }
            (SessionStatus::Waiting, _) => {
                let reservation = self
                    .policy
                    .reserve_target(&session, responder_id, now)
                    .await?;
                let transition = Transition::Assign {
                    responder: responder_id,
                    reason: AssignmentReason::Claimed,
                };
                (transition, reservation)
            }
        };

        // Only a lost session update means someone else claimed it
        self.commit(&session, transition, Some(reservation), now)
            .await
            .map_err(|err| match err {
                DeskError::Conflict(_) => DeskError::InvalidState(format!(
                    "session {} was claimed concurrently",
                    session_id
                )),
                other => other,
            })
    }

    /// Hand an active session from its current responder to another one
    pub async fn transfer_session(
        &self,
        session_id: SessionId,
        from: ResponderId,
        to: Option<ResponderId>,
    ) -> DeskResult<ChatSession> {
        if to == Some(from) {
            return Err(DeskError::Validation(
                "cannot transfer a session to its current responder".to_string(),
            ));
        }

        let _guard = self.session_locks.lock(&session_id).await;
        let session = self.load(session_id).await?;
        let now = OffsetDateTime::now_utc();
        let from = ResponderRef::Human(from);
        lifecycle::ensure_transferable(&session, from)?;

        let reservation = self
            .policy
            .reserve_transfer(&session, from, to, now)
            .await?;
        let transition = Transition::Transfer {
            from,
            to: reservation.responder,
            reason: AssignmentReason::Transferred,
        };
        self.commit(&session, transition, Some(reservation), now)
            .await
    }

    pub async fn complete_session(&self, session_id: SessionId) -> DeskResult<ChatSession> {
        let _guard = self.session_locks.lock(&session_id).await;
        let session = self.load(session_id).await?;
        let now = OffsetDateTime::now_utc();
        let former = session.assigned_human();

        let completed = self
            .commit(&session, Transition::Complete, None, now)
            .await?;
        if let Some(responder) = former {
            self.policy.release_on_completion(&completed, responder).await;
        }
        Ok(completed)
    }

    /// Flag messages from the other side up to `up_to_seq` as read by `reader`
    pub async fn mark_read(
        &self,
        session_id: SessionId,
        reader: SenderType,
        up_to_seq: i64,
    ) -> DeskResult<ChatSession> {
        let _guard = self.session_locks.lock(&session_id).await;
        self.ledger
            .mark_read(session_id, reader, up_to_seq, OffsetDateTime::now_utc())
            .await
    }

    pub async fn responder_workload(&self) -> DeskResult<Vec<ResponderWorkload>> {
        let responders = self.directory.list(&ResponderFilter::default()).await?;
        Ok(responders.into_iter().map(ResponderWorkload::from).collect())
    }

    pub async fn register_responder(
        &self,
        responder: ResponderAvailability,
    ) -> DeskResult<ResponderAvailability> {
        if responder.display_name.trim().is_empty() {
            return Err(DeskError::Validation("display_name is required".to_string()));
        }
        let stored = self.directory.upsert(responder).await?;
        tracing::info!(
            responder_id = %stored.id,
            capacity = stored.capacity,
            "Responder registered"
        );
        Ok(stored)
    }

    pub async fn set_availability(
        &self,
        responder_id: ResponderId,
        update: AvailabilityUpdate,
    ) -> DeskResult<ResponderAvailability> {
        let updated = self
            .directory
            .set_availability(responder_id, update)
            .await?;
        tracing::info!(
            responder_id = %responder_id,
            on_call = updated.on_call,
            active = updated.active,
            "Responder availability changed"
        );
        Ok(updated)
    }

    pub async fn ping(&self) -> DeskResult<()> {
        Ok(self.store.ping().await?)
    }

    /// Forget lock entries for sessions and clients nobody is touching
    pub fn prune_locks(&self) {
        self.session_locks.prune();
        self.client_locks.prune();
    }

    /// Drop load-change tokens past the retention window
    pub async fn prune_operation_log(&self) -> DeskResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - self.settings.operation_retention;
        let pruned = self.directory.prune_operations(cutoff).await?;
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned applied load-change tokens");
        }
        Ok(pruned)
    }

    fn validate_subject(&self, subject: &str) -> DeskResult<String> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(DeskError::Validation("subject is required".to_string()));
        }
        if subject.chars().count() > self.settings.max_subject_length {
            return Err(DeskError::Validation(format!(
                "subject exceeds {} characters",
                self.settings.max_subject_length
            )));
        }
        Ok(subject.to_string())
    }

    async fn load(&self, session_id: SessionId) -> DeskResult<ChatSession> {
        match self.store.get(session_id).await {
            Ok(session) => Ok(session),
            Err(StoreError::NotFound(_)) => Err(DeskError::session_not_found(session_id)),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_open(&self, client_id: ClientId) -> DeskResult<Option<ChatSession>> {
        let mut open = self
            .store
            .list(
                &SessionFilter::open_for_client(client_id),
                SessionSort::StartedAtDesc,
                1,
            )
            .await?;
        Ok(open.pop())
    }

    /// Routing pass for a waiting session. Caller holds the session lock.
    async fn route_waiting(
        &self,
        session: ChatSession,
        now: OffsetDateTime,
    ) -> DeskResult<ChatSession> {
        if session.status != SessionStatus::Waiting {
            return Ok(session);
        }

        match self.policy.reserve_best(&session, now).await {
            Ok(Some(reservation)) => {
                let transition = Transition::Assign {
                    responder: reservation.responder,
                    reason: AssignmentReason::Routed,
                };
                return match self.commit(&session, transition, Some(reservation), now).await {
                    Err(DeskError::Conflict(_)) => self.load(session.id).await,
                    other => other,
                };
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %err,
                    "Routing failed, session stays waiting"
                );
            }
        }

        if self.settings.bot_fallback_enabled
            && session.waited(now) >= self.settings.wait_threshold
        {
            return match self.commit(&session, Transition::TimeoutToBot, None, now).await {
                Err(DeskError::Conflict(_)) => self.load(session.id).await,
                other => other,
            };
        }

        Ok(session)
    }

    /// Plan and apply one transition, undoing `reservation` if the session
    /// update does not go through
    async fn commit(
        &self,
        session: &ChatSession,
        transition: Transition,
        reservation: Option<Reservation>,
        now: OffsetDateTime,
    ) -> DeskResult<ChatSession> {
        let patch = match lifecycle::plan(session, transition, now) {
            Ok(Some(patch)) => patch,
            Ok(None) => {
                if let Some(reservation) = reservation {
                    self.policy.compensate(session, reservation).await;
                }
                return Ok(session.clone());
            }
            Err(err) => {
                if let Some(reservation) = reservation {
                    self.policy.compensate(session, reservation).await;
                }
                return Err(err);
            }
        };

        match self.store.update(session.id, patch).await {
            Ok(updated) => {
                tracing::info!(
                    session_id = %updated.id,
                    status = updated.status.as_str(),
                    responder = ?updated.responder,
                    transition = ?transition,
                    "Session transition applied"
                );
                Ok(updated)
            }
            Err(StoreError::PreconditionFailed(reason)) => {
                if let Some(reservation) = reservation {
                    self.policy.compensate(session, reservation).await;
                }
                Err(DeskError::Conflict(format!(
                    "session {} changed concurrently: {}",
                    session.id, reason
                )))
            }
            Err(err) => {
                if reservation.is_some() {
                    tracing::error!(
                        session_id = %session.id,
                        error = %err,
                        "Session update failed with unknown outcome, reservation kept"
                    );
                }
                Err(err.into())
            }
        }
    }
}
