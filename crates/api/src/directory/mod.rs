//! Responder directory seam
//!
//! Load counters only move through token-guarded operations: the directory
//! remembers every [`OperationToken`] it applied, so a retried assignment or
//! release is reported as [`LoadChange::AlreadyApplied`] instead of being
//! counted twice.

pub mod memory;
pub mod postgres;

use std::fmt;

use async_trait::async_trait;
use livedesk_shared::{DeskError, ResponderAvailability, ResponderId, ResponderRef, SessionId};
use time::OffsetDateTime;
use uuid::Uuid;

pub use memory::MemoryResponderDirectory;
pub use postgres::PgResponderDirectory;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Responder not found: {0}")]
    NotFound(ResponderId),

    /// Compare-and-swap on the load counter lost
    #[error("Responder {id} load changed (now {current})")]
    LoadChanged { id: ResponderId, current: u32 },

    #[error("Responder {0} is at capacity")]
    AtCapacity(ResponderId),

    #[error("Responder {0} is off call or inactive")]
    Ineligible(ResponderId),

    #[error("Responder directory unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for DirectoryError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "Responder directory database error");
        DirectoryError::Unavailable(err.to_string())
    }
}

impl From<DirectoryError> for DeskError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(id) => DeskError::responder_not_found(id),
            DirectoryError::LoadChanged { .. } => DeskError::Conflict(err.to_string()),
            DirectoryError::AtCapacity(_) | DirectoryError::Ineligible(_) => {
                DeskError::Capacity(err.to_string())
            }
            DirectoryError::Unavailable(msg) => DeskError::ServiceUnavailable(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadChange {
    Applied(ResponderAvailability),
    /// The token was seen before; nothing changed
    AlreadyApplied,
}

impl LoadChange {
    pub fn was_applied(&self) -> bool {
        matches!(self, LoadChange::Applied(_))
    }
}

/// Idempotency key for one logical load change.
///
/// Reserving load is keyed by the reservation that made it, so only the
/// caller holding that reservation can undo it. Releasing load on completion
/// is keyed by the session's assignment epoch, so any process completing the
/// same session produces the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationToken(String);

impl OperationToken {
    pub fn assign(session: SessionId, responder: ResponderId, reservation: Uuid) -> Self {
        Self(format!("assign:{}:{}:{}", session, responder, reservation))
    }

    /// Reverse of an assignment whose session update lost its race
    pub fn undo_assign(session: SessionId, responder: ResponderId, reservation: Uuid) -> Self {
        Self(format!("undo-assign:{}:{}:{}", session, responder, reservation))
    }

    pub fn release(session: SessionId, responder: ResponderId, epoch: usize) -> Self {
        Self(format!("release:{}:{}:{}", session, responder, epoch))
    }

    pub fn transfer(
        session: SessionId,
        from: ResponderRef,
        to: ResponderId,
        reservation: Uuid,
    ) -> Self {
        Self(format!("transfer:{}:{}:{}:{}", session, from, to, reservation))
    }

    /// Reverse of a transfer whose session update lost its race
    pub fn revert_transfer(
        session: SessionId,
        from: ResponderRef,
        to: ResponderId,
        reservation: Uuid,
    ) -> Self {
        Self(format!(
            "revert-transfer:{}:{}:{}:{}",
            session, from, to, reservation
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponderFilter {
    pub on_call: Option<bool>,
    pub active: Option<bool>,
    pub has_capacity: Option<bool>,
}

impl ResponderFilter {
    /// On call, active and below capacity
    pub fn eligible() -> Self {
        Self {
            on_call: Some(true),
            active: Some(true),
            has_capacity: Some(true),
        }
    }

    pub fn matches(&self, responder: &ResponderAvailability) -> bool {
        self.on_call.map_or(true, |v| responder.on_call == v)
            && self.active.map_or(true, |v| responder.active == v)
            && self.has_capacity.map_or(true, |v| responder.has_capacity() == v)
    }
}

/// Why `responder` cannot take one more session, if anything
pub(crate) fn check_target(
    responder: &ResponderAvailability,
    expected_load: Option<u32>,
) -> Result<(), DirectoryError> {
    if !responder.on_call || !responder.active {
        return Err(DirectoryError::Ineligible(responder.id));
    }
    if let Some(expected) = expected_load {
        if responder.load != expected {
            return Err(DirectoryError::LoadChanged {
                id: responder.id,
                current: responder.load,
            });
        }
    }
    if !responder.has_capacity() {
        return Err(DirectoryError::AtCapacity(responder.id));
    }
    Ok(())
}

/// Availability toggles a responder can flip from the dashboard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
pub struct AvailabilityUpdate {
    pub on_call: Option<bool>,
    pub active: Option<bool>,
}

/// On-call/active responders and their load vs. capacity
#[async_trait]
pub trait ResponderDirectory: Send + Sync {
    async fn list(
        &self,
        filter: &ResponderFilter,
    ) -> Result<Vec<ResponderAvailability>, DirectoryError>;

    async fn get(&self, id: ResponderId) -> Result<ResponderAvailability, DirectoryError>;

    /// Insert or replace a responder's profile. Load is preserved for existing responders.
    async fn upsert(
        &self,
        responder: ResponderAvailability,
    ) -> Result<ResponderAvailability, DirectoryError>;

    async fn set_availability(
        &self,
        id: ResponderId,
        update: AvailabilityUpdate,
    ) -> Result<ResponderAvailability, DirectoryError>;

    /// Add one unit of load if the current load still equals `expected_load`
    /// and the responder is eligible.
    async fn increment_load(
        &self,
        id: ResponderId,
        expected_load: u32,
        token: &OperationToken,
        now: OffsetDateTime,
    ) -> Result<LoadChange, DirectoryError>;

    /// Remove one unit of load (never below zero)
    async fn decrement_load(
        &self,
        id: ResponderId,
        token: &OperationToken,
    ) -> Result<LoadChange, DirectoryError>;

    /// Move one unit of load from `from` to `to` as a single all-or-nothing change.
    ///
    /// `from = None` only increments `to` (escalation away from the automated
    /// responder). `expected_to_load = None` skips the compare-and-swap on `to`
    /// but still enforces eligibility.
    async fn transfer_load(
        &self,
        from: Option<ResponderId>,
        to: ResponderId,
        expected_to_load: Option<u32>,
        token: &OperationToken,
        now: OffsetDateTime,
    ) -> Result<LoadChange, DirectoryError>;

    /// Forget applied tokens recorded before `older_than`. Returns how many were dropped.
    async fn prune_operations(&self, older_than: OffsetDateTime) -> Result<u64, DirectoryError>;
}
