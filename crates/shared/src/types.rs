//! Chat session domain types used across LiveDesk

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DeskError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Chat session ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Support client (widget visitor) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ClientId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Human responder (staff member) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponderId(pub Uuid);

impl ResponderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResponderId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ResponderId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ResponderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Session lifecycle status. Only ever advances forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    /// Waiting and active sessions count as open
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Completed)
    }

    /// Forward-only transition table (active → active is a responder swap)
    pub fn can_advance_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Active)
                | (Self::Waiting, Self::Completed)
                | (Self::Active, Self::Active)
                | (Self::Active, Self::Completed)
        )
    }
}

impl FromStr for SessionStatus {
    type Err = DeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(DeskError::Validation(format!("unknown session status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }
}

impl FromStr for Priority {
    type Err = DeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(DeskError::Validation(format!("unknown priority: {}", other))),
        }
    }
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    Client,
    HumanResponder,
    AutomatedResponder,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::HumanResponder => "human_responder",
            Self::AutomatedResponder => "automated_responder",
        }
    }

    /// Whether this sender is on the support side of the conversation
    pub fn is_staff_side(&self) -> bool {
        !matches!(self, Self::Client)
    }
}

impl FromStr for SenderType {
    type Err = DeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Self::Client),
            "human_responder" => Ok(Self::HumanResponder),
            "automated_responder" => Ok(Self::AutomatedResponder),
            other => Err(DeskError::Validation(format!("unknown sender type: {}", other))),
        }
    }
}

/// Reference to whoever is handling a session.
///
/// `Automated` is the reserved automated-responder identity used when the
/// wait threshold elapses without a human assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResponderRef {
    Human(ResponderId),
    Automated,
}

impl ResponderRef {
    pub fn human_id(&self) -> Option<ResponderId> {
        match self {
            Self::Human(id) => Some(*id),
            Self::Automated => None,
        }
    }

    pub fn is_automated(&self) -> bool {
        matches!(self, Self::Automated)
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Human(_) => "human",
            Self::Automated => "automated",
        }
    }
}

impl fmt::Display for ResponderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Human(id) => write!(f, "human:{}", id),
            Self::Automated => f.write_str("automated"),
        }
    }
}

// =============================================================================
// Messages and Sessions
// =============================================================================

/// A single ledger entry. Immutable once appended except for `read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Uuid>,
    pub sender_type: SenderType,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentReason {
    Routed,
    Claimed,
    Transferred,
    BotFallback,
    Completed,
}

/// One entry of a session's assignment history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentEvent {
    pub from: Option<ResponderRef>,
    pub to: Option<ResponderRef>,
    pub reason: AssignmentReason,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Authoritative support conversation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: SessionId,
    pub client_id: ClientId,
    pub responder: Option<ResponderRef>,
    pub status: SessionStatus,
    pub priority: Priority,
    pub subject: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub assignments: Vec<AssignmentEvent>,
}

impl ChatSession {
    /// Build a fresh `waiting` session
    pub fn new(
        client_id: ClientId,
        subject: impl Into<String>,
        priority: Priority,
        metadata: serde_json::Value,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: SessionId::new(),
            client_id,
            responder: None,
            status: SessionStatus::Waiting,
            priority,
            subject: subject.into(),
            metadata,
            started_at: now,
            updated_at: now,
            completed_at: None,
            messages: Vec::new(),
            assignments: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Highest sequence number in the ledger (0 when empty)
    pub fn last_seq(&self) -> i64 {
        self.messages.last().map(|m| m.seq).unwrap_or(0)
    }

    pub fn next_seq(&self) -> i64 {
        self.last_seq() + 1
    }

    pub fn find_by_dedup_token(&self, token: &str) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.dedup_token.as_deref() == Some(token))
    }

    pub fn assigned_human(&self) -> Option<ResponderId> {
        self.responder.and_then(|r| r.human_id())
    }

    /// Number of assignment transitions so far; part of every load-operation token
    pub fn assignment_epoch(&self) -> usize {
        self.assignments.len()
    }

    /// How long the session has existed as of `now`
    pub fn waited(&self, now: OffsetDateTime) -> std::time::Duration {
        std::time::Duration::try_from(now - self.started_at).unwrap_or_default()
    }

    /// Messages the given side has not read yet (messages from the other side)
    pub fn unread_count(&self, reader: SenderType) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.read && m.sender_type.is_staff_side() != reader.is_staff_side())
            .count()
    }

    /// Check the record-level invariants: responder set iff active, strictly increasing seqs
    pub fn check_invariants(&self) -> Result<(), String> {
        let active = self.status == SessionStatus::Active;
        if active != self.responder.is_some() {
            return Err(format!(
                "session {} has status {} but responder {:?}",
                self.id,
                self.status.as_str(),
                self.responder
            ));
        }
        for pair in self.messages.windows(2) {
            if pair[0].seq >= pair[1].seq {
                return Err(format!(
                    "session {} ledger out of order: {} then {}",
                    self.id, pair[0].seq, pair[1].seq
                ));
            }
        }
        Ok(())
    }
}

/// Coarse assignment outcome reported to the widget when a session starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// A human responder owns the session
    Assigned,
    /// Still waiting for a human
    Queued,
    /// The automated responder took over
    Automated,
    Closed,
}

impl From<&ChatSession> for AssignmentStatus {
    fn from(session: &ChatSession) -> Self {
        match (session.status, session.responder) {
            (SessionStatus::Completed, _) => Self::Closed,
            (_, Some(ResponderRef::Automated)) => Self::Automated,
            (_, Some(ResponderRef::Human(_))) => Self::Assigned,
            (_, None) => Self::Queued,
        }
    }
}

// =============================================================================
// Responder availability
// =============================================================================

/// Snapshot of one responder's eligibility and load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderAvailability {
    pub id: ResponderId,
    pub display_name: String,
    pub on_call: bool,
    pub active: bool,
    pub load: u32,
    pub capacity: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_assigned_at: Option<OffsetDateTime>,
}

impl ResponderAvailability {
    /// A responder that is on call, active and idle
    pub fn new(id: ResponderId, display_name: impl Into<String>, capacity: u32) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            on_call: true,
            active: true,
            load: 0,
            capacity,
            last_assigned_at: None,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.load < self.capacity
    }

    /// Eligible for a new assignment
    pub fn is_eligible(&self) -> bool {
        self.on_call && self.active && self.has_capacity()
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Filter for listing sessions.
///
/// `responder` restricts results to sessions assigned to that responder; with
/// `include_waiting` unassigned waiting sessions are returned as well (the
/// staff dashboard queue).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<ResponderRef>,
    #[serde(default)]
    pub include_waiting: bool,
    #[serde(default)]
    pub statuses: Vec<SessionStatus>,
}

impl SessionFilter {
    /// The client's open session, if any
    pub fn open_for_client(client_id: ClientId) -> Self {
        Self {
            client_id: Some(client_id),
            statuses: vec![SessionStatus::Waiting, SessionStatus::Active],
            ..Default::default()
        }
    }

    /// A responder's assigned sessions plus the shared waiting queue
    pub fn staff_queue(responder_id: ResponderId) -> Self {
        Self {
            responder: Some(ResponderRef::Human(responder_id)),
            include_waiting: true,
            statuses: vec![SessionStatus::Waiting, SessionStatus::Active],
            ..Default::default()
        }
    }

    pub fn waiting() -> Self {
        Self {
            statuses: vec![SessionStatus::Waiting],
            ..Default::default()
        }
    }

    pub fn matches(&self, session: &ChatSession) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&session.status) {
            return false;
        }
        if let Some(client_id) = self.client_id {
            if session.client_id != client_id {
                return false;
            }
        }
        if let Some(responder) = self.responder {
            let assigned = session.responder == Some(responder);
            let queued = self.include_waiting && session.status == SessionStatus::Waiting;
            if !assigned && !queued {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSort {
    StartedAtAsc,
    #[default]
    StartedAtDesc,
    UpdatedAtDesc,
    /// Highest priority first, then oldest first
    QueueOrder,
}

impl SessionSort {
    pub fn compare(&self, a: &ChatSession, b: &ChatSession) -> Ordering {
        match self {
            Self::StartedAtAsc => a.started_at.cmp(&b.started_at),
            Self::StartedAtDesc => b.started_at.cmp(&a.started_at),
            Self::UpdatedAtDesc => b.updated_at.cmp(&a.updated_at),
            Self::QueueOrder => b
                .priority
                .rank()
                .cmp(&a.priority.rank())
                .then_with(|| a.started_at.cmp(&b.started_at)),
        }
    }
}
