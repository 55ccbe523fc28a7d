//! End-to-end desk behavior against the in-memory store and directory

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livedesk_api::assistant::{
    AssistantError, AutomatedResponder, BotReply, CannedResponder, CircuitBreakerConfig,
    FallbackAssistant,
};
use livedesk_api::desk::{ChatService, DeskSettings, NewMessage, StartSession};
use livedesk_api::directory::{
    AvailabilityUpdate, DirectoryError, LoadChange, MemoryResponderDirectory, OperationToken,
    ResponderDirectory, ResponderFilter,
};
use livedesk_api::store::MemorySessionStore;
use livedesk_shared::{
    AssignmentReason, AssignmentStatus, ClientId, DeskError, Message, Priority,
    ResponderAvailability, ResponderId, ResponderRef, SenderType, SessionStatus,
};
use time::OffsetDateTime;
use tokio::sync::Notify;

struct Harness {
    desk: Arc<ChatService>,
    store: Arc<MemorySessionStore>,
    directory: Arc<MemoryResponderDirectory>,
}

impl Harness {
    fn new(wait_threshold: Duration, assistant: Option<FallbackAssistant>) -> Self {
        let store = Arc::new(MemorySessionStore::new());
        let directory = Arc::new(MemoryResponderDirectory::new());
        let desk = Arc::new(ChatService::new(
            store.clone(),
            directory.clone(),
            assistant,
            settings(wait_threshold),
        ));
        Self {
            desk,
            store,
            directory,
        }
    }

    /// Another process sharing the same store and directory
    fn peer(&self) -> ChatService {
        ChatService::new(
            self.store.clone(),
            self.directory.clone(),
            None,
            settings(Duration::from_secs(3600)),
        )
    }

    async fn responder(&self, name: &str, load: u32, capacity: u32) -> ResponderId {
        let mut responder = ResponderAvailability::new(ResponderId::new(), name, capacity);
        responder.load = load;
        self.directory.upsert(responder).await.unwrap().id
    }

    async fn load_of(&self, id: ResponderId) -> u32 {
        self.directory.get(id).await.unwrap().load
    }
}

fn settings(wait_threshold: Duration) -> DeskSettings {
    DeskSettings {
        wait_threshold,
        ..DeskSettings::default()
    }
}

fn start(client_id: ClientId) -> StartSession {
    StartSession {
        client_id,
        subject: "My package never arrived".to_string(),
        priority: Priority::Medium,
        metadata: serde_json::json!({"page": "/orders/42"}),
    }
}

fn patient() -> Duration {
    Duration::from_secs(3600)
}

#[tokio::test]
async fn scenario_a_no_responders_times_out_to_bot() {
    let h = Harness::new(Duration::from_millis(50), None);

    let started = h.desk.start_session(start(ClientId::new())).await.unwrap();
    assert_eq!(started.session.status, SessionStatus::Waiting);
    assert_eq!(started.assignment_status, AssignmentStatus::Queued);

    let early = h.desk.poll_session(started.session.id).await.unwrap();
    assert_eq!(early.status, SessionStatus::Waiting);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let late = h.desk.poll_session(started.session.id).await.unwrap();
    assert_eq!(late.status, SessionStatus::Active);
    assert_eq!(late.responder, Some(ResponderRef::Automated));
    assert_eq!(late.assignments.len(), 1);
    assert_eq!(late.assignments[0].reason, AssignmentReason::BotFallback);
}

#[tokio::test]
async fn scenario_b_routes_to_least_loaded_responder() {
    let h = Harness::new(patient(), None);
    let r1 = h.responder("Avery", 3, 3).await;
    let r2 = h.responder("Blake", 1, 3).await;

    let started = h.desk.start_session(start(ClientId::new())).await.unwrap();

    assert_eq!(started.assignment_status, AssignmentStatus::Assigned);
    assert_eq!(started.session.responder, Some(ResponderRef::Human(r2)));
    assert_eq!(h.load_of(r1).await, 3);
    assert_eq!(h.load_of(r2).await, 2);
}

#[tokio::test]
async fn scenario_c_concurrent_posts_get_distinct_ordered_seqs() {
    let h = Harness::new(patient(), None);
    let client = ClientId::new();
    let session_id = h.desk.start_session(start(client)).await.unwrap().session.id;

    let posts = ["first", "second", "third", "fourth"].map(|content| {
        let desk = h.desk.clone();
        tokio::spawn(async move {
            desk.post_message(
                session_id,
                NewMessage::from_client(client, content, Some(format!("tok-{}", content))),
            )
            .await
        })
    });
    for post in posts {
        post.await.unwrap().unwrap();
    }

    let session = h.desk.poll_session(session_id).await.unwrap();
    let seqs: Vec<i64> = session.messages.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    for content in ["first", "second", "third", "fourth"] {
        let token = format!("tok-{}", content);
        let message = session.find_by_dedup_token(&token).unwrap();
        assert_eq!(message.content, content);
    }
}

#[tokio::test]
async fn scenario_d_transfer_without_capacity_keeps_responder() {
    let h = Harness::new(patient(), None);
    let r1 = h.responder("Casey", 0, 2).await;
    let session = h.desk.start_session(start(ClientId::new())).await.unwrap().session;
    assert_eq!(session.responder, Some(ResponderRef::Human(r1)));

    let r2 = h.responder("Drew", 1, 1).await;
    let err = h
        .desk
        .transfer_session(session.id, r1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DeskError::Capacity(_)));

    let unchanged = h.desk.poll_session(session.id).await.unwrap();
    assert_eq!(unchanged.responder, Some(ResponderRef::Human(r1)));
    assert_eq!(h.load_of(r1).await, 1);
    assert_eq!(h.load_of(r2).await, 1);
}

#[tokio::test]
async fn start_twice_returns_same_session() {
    let h = Harness::new(patient(), None);
    let client = ClientId::new();

    let first = h.desk.start_session(start(client)).await.unwrap();
    let second = h.desk.start_session(start(client)).await.unwrap();

    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(first.session.id, second.session.id);
}

#[tokio::test]
async fn concurrent_starts_open_one_session() {
    let h = Harness::new(patient(), None);
    let peer = Arc::new(h.peer());
    let client = ClientId::new();

    let a = {
        let desk = h.desk.clone();
        tokio::spawn(async move { desk.start_session(start(client)).await })
    };
    let b = {
        let desk = peer.clone();
        tokio::spawn(async move { desk.start_session(start(client)).await })
    };
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_eq!(a.session.id, b.session.id);
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test]
async fn post_after_complete_is_rejected() {
    let h = Harness::new(patient(), None);
    let client = ClientId::new();
    let session = h.desk.start_session(start(client)).await.unwrap().session;
    h.desk
        .post_message(session.id, NewMessage::from_client(client, "hello", None))
        .await
        .unwrap();

    let completed = h.desk.complete_session(session.id).await.unwrap();
    assert_eq!(completed.status, SessionStatus::Completed);
    assert!(completed.completed_at.is_some());

    let err = h
        .desk
        .post_message(session.id, NewMessage::from_client(client, "anyone?", None))
        .await
        .unwrap_err();
    assert!(matches!(err, DeskError::InvalidState(_)));

    let after = h.desk.poll_session(session.id).await.unwrap();
    assert_eq!(after.messages.len(), 1);

    let again = h.desk.complete_session(session.id).await.unwrap_err();
    assert!(matches!(again, DeskError::InvalidState(_)));
}

#[tokio::test]
async fn complete_releases_responder_load() {
    let h = Harness::new(patient(), None);
    let r = h.responder("Emery", 0, 1).await;
    let session = h.desk.start_session(start(ClientId::new())).await.unwrap().session;
    assert_eq!(h.load_of(r).await, 1);

    h.desk.complete_session(session.id).await.unwrap();
    assert_eq!(h.load_of(r).await, 0);

    // The freed slot goes to the next client
    let next = h.desk.start_session(start(ClientId::new())).await.unwrap();
    assert_eq!(next.session.responder, Some(ResponderRef::Human(r)));
}

#[tokio::test]
async fn dedup_retry_does_not_double_post() {
    let h = Harness::new(patient(), None);
    let client = ClientId::new();
    let session = h.desk.start_session(start(client)).await.unwrap().session;
    let message = NewMessage::from_client(client, "is anyone there?", Some("retry-1".into()));

    h.desk.post_message(session.id, message.clone()).await.unwrap();
    let retried = h.desk.post_message(session.id, message).await.unwrap();

    assert_eq!(retried.messages.len(), 1);
}

#[tokio::test]
async fn transfer_moves_load_between_responders() {
    let h = Harness::new(patient(), None);
    let r1 = h.responder("Finley", 0, 2).await;
    let session = h.desk.start_session(start(ClientId::new())).await.unwrap().session;
    let r2 = h.responder("Gray", 0, 2).await;

    let moved = h
        .desk
        .transfer_session(session.id, r1, Some(r2))
        .await
        .unwrap();

    assert_eq!(moved.responder, Some(ResponderRef::Human(r2)));
    let last = moved.assignments.last().unwrap();
    assert_eq!(last.reason, AssignmentReason::Transferred);
    assert_eq!(last.from, Some(ResponderRef::Human(r1)));
    assert_eq!(h.load_of(r1).await, 0);
    assert_eq!(h.load_of(r2).await, 1);

    // Only the current responder may hand the session on
    let err = h
        .desk
        .transfer_session(session.id, r1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DeskError::InvalidState(_)));
}

#[tokio::test]
async fn responder_messages_require_assignment() {
    let h = Harness::new(patient(), None);
    let r = h.responder("Harper", 0, 1).await;
    let stranger = h.responder("Indy", 0, 1).await;
    let session = h.desk.start_session(start(ClientId::new())).await.unwrap().session;
    assert_eq!(session.responder, Some(ResponderRef::Human(r)));

    let reply = h
        .desk
        .post_message(session.id, NewMessage::from_responder(r, "Hi, I can help", None))
        .await
        .unwrap();
    assert_eq!(reply.messages[0].sender_type, SenderType::HumanResponder);

    let err = h
        .desk
        .post_message(session.id, NewMessage::from_responder(stranger, "Me too", None))
        .await
        .unwrap_err();
    assert!(matches!(err, DeskError::InvalidState(_)));
}

#[tokio::test]
async fn mark_read_flags_other_side_only() {
    let h = Harness::new(patient(), None);
    let client = ClientId::new();
    let r = h.responder("Jules", 0, 1).await;
    let session = h.desk.start_session(start(client)).await.unwrap().session;

    h.desk
        .post_message(session.id, NewMessage::from_client(client, "hello", None))
        .await
        .unwrap();
    h.desk
        .post_message(session.id, NewMessage::from_responder(r, "hi!", None))
        .await
        .unwrap();

    let read = h
        .desk
        .mark_read(session.id, SenderType::HumanResponder, 2)
        .await
        .unwrap();
    assert!(read.messages[0].read);
    assert!(!read.messages[1].read);
    assert_eq!(read.unread_count(SenderType::Client), 1);
}

// =============================================================================
// Automated responder
// =============================================================================

struct SlowResponder(Duration);

#[async_trait]
impl AutomatedResponder for SlowResponder {
    async fn generate_reply(&self, _: &[Message]) -> Result<BotReply, AssistantError> {
        tokio::time::sleep(self.0).await;
        Ok(BotReply {
            content: "sorry for the wait".to_string(),
        })
    }
}

struct FailingResponder {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl AutomatedResponder for FailingResponder {
    async fn generate_reply(&self, _: &[Message]) -> Result<BotReply, AssistantError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AssistantError::Status(500))
    }
}

fn assistant(responder: Arc<dyn AutomatedResponder>, timeout: Duration) -> FallbackAssistant {
    FallbackAssistant::new(
        responder,
        timeout,
        CircuitBreakerConfig {
            failure_threshold: 1,
            min_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
        },
    )
}

#[tokio::test]
async fn bot_replies_while_waiting() {
    let canned = Arc::new(CannedResponder::new("An agent will be with you soon."));
    let h = Harness::new(patient(), Some(assistant(canned, Duration::from_secs(1))));
    let client = ClientId::new();
    let session = h.desk.start_session(start(client)).await.unwrap().session;

    let updated = h
        .desk
        .post_message(session.id, NewMessage::from_client(client, "hello?", None))
        .await
        .unwrap();

    assert_eq!(updated.messages.len(), 2);
    assert_eq!(updated.messages[1].sender_type, SenderType::AutomatedResponder);
    assert_eq!(updated.messages[1].seq, 2);
    assert_eq!(updated.status, SessionStatus::Waiting);
}

#[tokio::test]
async fn bot_timeout_keeps_client_message() {
    let slow = Arc::new(SlowResponder(Duration::from_millis(500)));
    let h = Harness::new(patient(), Some(assistant(slow, Duration::from_millis(20))));
    let client = ClientId::new();
    let session = h.desk.start_session(start(client)).await.unwrap().session;

    let updated = h
        .desk
        .post_message(session.id, NewMessage::from_client(client, "hello?", None))
        .await
        .unwrap();

    assert_eq!(updated.messages.len(), 1);
    assert_eq!(updated.messages[0].sender_type, SenderType::Client);
}

#[tokio::test]
async fn open_breaker_skips_the_bot() {
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = Arc::new(FailingResponder {
        calls: calls.clone(),
    });
    let h = Harness::new(patient(), Some(assistant(failing, Duration::from_secs(1))));
    let client = ClientId::new();
    let session = h.desk.start_session(start(client)).await.unwrap().session;

    for text in ["one", "two", "three"] {
        h.desk
            .post_message(session.id, NewMessage::from_client(client, text, None))
            .await
            .unwrap();
    }

    let session = h.desk.poll_session(session.id).await.unwrap();
    assert_eq!(session.messages.len(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn no_bot_reply_once_a_human_has_the_session() {
    let canned = Arc::new(CannedResponder::new("beep"));
    let h = Harness::new(patient(), Some(assistant(canned, Duration::from_secs(1))));
    h.responder("Kai", 0, 1).await;
    let client = ClientId::new();
    let session = h.desk.start_session(start(client)).await.unwrap().session;
    assert_eq!(session.status, SessionStatus::Active);

    let updated = h
        .desk
        .post_message(session.id, NewMessage::from_client(client, "hi", None))
        .await
        .unwrap();
    assert_eq!(updated.messages.len(), 1);
}

// =============================================================================
// Claims
// =============================================================================

#[tokio::test]
async fn claim_race_has_one_winner() {
    let h = Harness::new(patient(), None);
    let peer = Arc::new(h.peer());
    let session = h.desk.start_session(start(ClientId::new())).await.unwrap().session;
    assert_eq!(session.status, SessionStatus::Waiting);
    let session_id = session.id;

    let r1 = h.responder("Lee", 0, 5).await;
    let r2 = h.responder("Morgan", 0, 5).await;

    let a = {
        let desk = h.desk.clone();
        tokio::spawn(async move { desk.claim_session(session_id, r1).await })
    };
    let b = {
        let desk = peer.clone();
        tokio::spawn(async move { desk.claim_session(session_id, r2).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(loser, DeskError::InvalidState(_)));

    let winner = winners[0].responder.and_then(|r| r.human_id()).unwrap();
    let (winner_load, loser_load) = if winner == r1 {
        (h.load_of(r1).await, h.load_of(r2).await)
    } else {
        (h.load_of(r2).await, h.load_of(r1).await)
    };
    assert_eq!(winner_load, 1);
    assert_eq!(loser_load, 0);
}

#[tokio::test]
async fn claim_is_idempotent_for_the_owner() {
    let h = Harness::new(patient(), None);
    let session = h.desk.start_session(start(ClientId::new())).await.unwrap().session;
    let r = h.responder("Nico", 0, 3).await;

    let first = h.desk.claim_session(session.id, r).await.unwrap();
    let second = h.desk.claim_session(session.id, r).await.unwrap();

    assert_eq!(first.responder, Some(ResponderRef::Human(r)));
    assert_eq!(second.assignments.len(), 1);
    assert_eq!(h.load_of(r).await, 1);
}

#[tokio::test]
async fn claim_escalates_bot_session() {
    let h = Harness::new(Duration::from_millis(10), None);
    let session = h.desk.start_session(start(ClientId::new())).await.unwrap().session;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let automated = h.desk.poll_session(session.id).await.unwrap();
    assert_eq!(automated.responder, Some(ResponderRef::Automated));

    let r = h.responder("Oakley", 0, 1).await;
    let claimed = h.desk.claim_session(session.id, r).await.unwrap();

    assert_eq!(claimed.responder, Some(ResponderRef::Human(r)));
    let last = claimed.assignments.last().unwrap();
    assert_eq!(last.reason, AssignmentReason::Claimed);
    assert_eq!(last.from, Some(ResponderRef::Automated));
    assert_eq!(h.load_of(r).await, 1);
}

#[tokio::test]
async fn claim_by_full_responder_is_capacity_error() {
    let h = Harness::new(patient(), None);
    let session = h.desk.start_session(start(ClientId::new())).await.unwrap().session;
    let r = h.responder("Parker", 1, 1).await;

    let err = h.desk.claim_session(session.id, r).await.unwrap_err();
    assert!(matches!(err, DeskError::Capacity(_)));
    let still = h.desk.poll_session(session.id).await.unwrap();
    assert_eq!(still.status, SessionStatus::Waiting);
}

// =============================================================================
// Cross-process load accounting
// =============================================================================

enum Interference {
    /// Apply the first increment, then hold the caller until resumed
    ParkAfterFirstIncrement,
    /// Every increment loses its compare-and-swap
    LoadAlwaysChanges,
}

/// Shares a directory with other services but interferes with this one's increments
struct InterposedDirectory {
    inner: MemoryResponderDirectory,
    interference: Interference,
    armed: AtomicBool,
    parked: Notify,
    resume: Notify,
}

impl InterposedDirectory {
    fn new(inner: &MemoryResponderDirectory, interference: Interference) -> Self {
        Self {
            inner: inner.clone(),
            interference,
            armed: AtomicBool::new(true),
            parked: Notify::new(),
            resume: Notify::new(),
        }
    }
}

#[async_trait]
impl ResponderDirectory for InterposedDirectory {
    async fn list(
        &self,
        filter: &ResponderFilter,
    ) -> Result<Vec<ResponderAvailability>, DirectoryError> {
        self.inner.list(filter).await
    }

    async fn get(&self, id: ResponderId) -> Result<ResponderAvailability, DirectoryError> {
        self.inner.get(id).await
    }

    async fn upsert(
        &self,
        responder: ResponderAvailability,
    ) -> Result<ResponderAvailability, DirectoryError> {
        self.inner.upsert(responder).await
    }

    async fn set_availability(
        &self,
        id: ResponderId,
        update: AvailabilityUpdate,
    ) -> Result<ResponderAvailability, DirectoryError> {
        self.inner.set_availability(id, update).await
    }

    async fn increment_load(
        &self,
        id: ResponderId,
        expected_load: u32,
        token: &OperationToken,
        now: OffsetDateTime,
    ) -> Result<LoadChange, DirectoryError> {
        match self.interference {
            Interference::LoadAlwaysChanges => Err(DirectoryError::LoadChanged {
                id,
                current: expected_load + 1,
            }),
            Interference::ParkAfterFirstIncrement => {
                let change = self.inner.increment_load(id, expected_load, token, now).await;
                if self.armed.swap(false, Ordering::SeqCst) {
                    self.parked.notify_one();
                    self.resume.notified().await;
                }
                change
            }
        }
    }

    async fn decrement_load(
        &self,
        id: ResponderId,
        token: &OperationToken,
    ) -> Result<LoadChange, DirectoryError> {
        self.inner.decrement_load(id, token).await
    }

    async fn transfer_load(
        &self,
        from: Option<ResponderId>,
        to: ResponderId,
        expected_to_load: Option<u32>,
        token: &OperationToken,
        now: OffsetDateTime,
    ) -> Result<LoadChange, DirectoryError> {
        self.inner
            .transfer_load(from, to, expected_to_load, token, now)
            .await
    }

    async fn prune_operations(&self, older_than: OffsetDateTime) -> Result<u64, DirectoryError> {
        self.inner.prune_operations(older_than).await
    }
}

#[tokio::test]
async fn losing_router_releases_only_its_own_reservation() {
    let h = Harness::new(patient(), None);
    let session = h.desk.start_session(start(ClientId::new())).await.unwrap().session;
    assert_eq!(session.status, SessionStatus::Waiting);
    let session_id = session.id;
    let r = h.responder("Quinn", 0, 2).await;

    let interposed = Arc::new(InterposedDirectory::new(
        &h.directory,
        Interference::ParkAfterFirstIncrement,
    ));
    let slow = Arc::new(ChatService::new(
        h.store.clone(),
        interposed.clone(),
        None,
        settings(patient()),
    ));

    let slow_poll = {
        let slow = slow.clone();
        tokio::spawn(async move { slow.poll_session(session_id).await })
    };
    interposed.parked.notified().await;
    assert_eq!(h.load_of(r).await, 1);

    // The other process routes the same session while the slow one is parked
    let routed = h.desk.poll_session(session_id).await.unwrap();
    assert_eq!(routed.responder, Some(ResponderRef::Human(r)));
    assert_eq!(h.load_of(r).await, 2);

    interposed.resume.notify_one();
    let seen = slow_poll.await.unwrap().unwrap();
    assert_eq!(seen.responder, Some(ResponderRef::Human(r)));
    assert_eq!(seen.assignments.len(), 1);
    assert_eq!(h.load_of(r).await, 1);

    // Capacity still holds: one more session fits, the next one waits
    let second = h.desk.start_session(start(ClientId::new())).await.unwrap();
    assert_eq!(second.session.responder, Some(ResponderRef::Human(r)));
    let third = h.desk.start_session(start(ClientId::new())).await.unwrap();
    assert_eq!(third.session.status, SessionStatus::Waiting);
    assert_eq!(h.load_of(r).await, 2);
}

#[tokio::test]
async fn claim_passes_through_load_churn_conflict() {
    let h = Harness::new(patient(), None);
    let session = h.desk.start_session(start(ClientId::new())).await.unwrap().session;
    let r = h.responder("Rowan", 0, 3).await;

    let churning = ChatService::new(
        h.store.clone(),
        Arc::new(InterposedDirectory::new(
            &h.directory,
            Interference::LoadAlwaysChanges,
        )),
        None,
        settings(patient()),
    );

    let err = churning.claim_session(session.id, r).await.unwrap_err();
    assert!(matches!(err, DeskError::Conflict(_)), "got {:?}", err);
    assert_eq!(h.load_of(r).await, 0);
    let still = churning.poll_session(session.id).await.unwrap();
    assert_eq!(still.status, SessionStatus::Waiting);
}
