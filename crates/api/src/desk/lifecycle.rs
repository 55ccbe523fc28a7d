//! Session state machine
//!
//! `waiting → active → completed`, or `waiting → completed`. Planning is
//! pure: [`plan`] looks at a snapshot and returns the compare-and-swap patch
//! that performs the transition, `None` when the transition has already
//! happened, or the error that forbids it.

use livedesk_shared::{
    AssignmentEvent, AssignmentReason, ChatSession, DeskError, DeskResult, ResponderId,
    ResponderRef, SessionStatus,
};
use time::OffsetDateTime;

use crate::store::SessionPatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// waiting → active with a human responder
    Assign {
        responder: ResponderId,
        reason: AssignmentReason,
    },
    /// active → active with the responder swapped
    Transfer {
        from: ResponderRef,
        to: ResponderId,
        reason: AssignmentReason,
    },
    /// waiting → active with the automated responder
    TimeoutToBot,
    /// waiting | active → completed
    Complete,
}

/// Whether `from` may hand the session over right now
pub fn ensure_transferable(session: &ChatSession, from: ResponderRef) -> DeskResult<()> {
    match session.status {
        SessionStatus::Completed => Err(DeskError::session_completed(session.id)),
        SessionStatus::Waiting => Err(DeskError::InvalidState(format!(
            "session {} is not active",
            session.id
        ))),
        SessionStatus::Active if session.responder != Some(from) => {
            Err(DeskError::InvalidState(format!(
                "session {} is not assigned to {}",
                session.id, from
            )))
        }
        SessionStatus::Active => Ok(()),
    }
}

pub fn plan(
    session: &ChatSession,
    transition: Transition,
    now: OffsetDateTime,
) -> DeskResult<Option<SessionPatch>> {
    match transition {
        Transition::Assign { responder, reason } => plan_assign(session, responder, reason, now),
        Transition::Transfer { from, to, reason } => plan_transfer(session, from, to, reason, now),
        Transition::TimeoutToBot => plan_timeout(session, now),
        Transition::Complete => plan_complete(session, now),
    }
}

fn plan_assign(
    session: &ChatSession,
    responder: ResponderId,
    reason: AssignmentReason,
    now: OffsetDateTime,
) -> DeskResult<Option<SessionPatch>> {
    let target = ResponderRef::Human(responder);
    match (session.status, session.responder) {
        (SessionStatus::Completed, _) => Err(DeskError::session_completed(session.id)),
        (SessionStatus::Active, Some(current)) if current == target => Ok(None),
        (SessionStatus::Active, current) => Err(DeskError::InvalidState(format!(
            "session {} is already handled by {}",
            session.id,
            current.map(|r| r.to_string()).unwrap_or_default()
        ))),
        (SessionStatus::Waiting, _) => Ok(Some(SessionPatch {
            status: Some(SessionStatus::Active),
            responder: Some(Some(target)),
            push_assignment: Some(AssignmentEvent {
                from: None,
                to: Some(target),
                reason,
                at: now,
            }),
            expect_status: Some(SessionStatus::Waiting),
            expect_responder: Some(None),
            ..SessionPatch::new(now)
        })),
    }
}

fn plan_transfer(
    session: &ChatSession,
    from: ResponderRef,
    to: ResponderId,
    reason: AssignmentReason,
    now: OffsetDateTime,
) -> DeskResult<Option<SessionPatch>> {
    let target = ResponderRef::Human(to);
    if from == target {
        return Err(DeskError::Validation(
            "cannot transfer a session to its current responder".to_string(),
        ));
    }
    if session.status == SessionStatus::Active && session.responder == Some(target) {
        return Ok(None);
    }
    ensure_transferable(session, from)?;

    Ok(Some(SessionPatch {
        responder: Some(Some(target)),
        push_assignment: Some(AssignmentEvent {
            from: Some(from),
            to: Some(target),
            reason,
            at: now,
        }),
        expect_status: Some(SessionStatus::Active),
        expect_responder: Some(Some(from)),
        ..SessionPatch::new(now)
    }))
}

fn plan_timeout(session: &ChatSession, now: OffsetDateTime) -> DeskResult<Option<SessionPatch>> {
    match session.status {
        SessionStatus::Completed => Err(DeskError::session_completed(session.id)),
        SessionStatus::Active => Ok(None),
        SessionStatus::Waiting => Ok(Some(SessionPatch {
            status: Some(SessionStatus::Active),
            responder: Some(Some(ResponderRef::Automated)),
            push_assignment: Some(AssignmentEvent {
                from: None,
                to: Some(ResponderRef::Automated),
                reason: AssignmentReason::BotFallback,
                at: now,
            }),
            expect_status: Some(SessionStatus::Waiting),
            expect_responder: Some(None),
            ..SessionPatch::new(now)
        })),
    }
}

fn plan_complete(session: &ChatSession, now: OffsetDateTime) -> DeskResult<Option<SessionPatch>> {
    if session.status == SessionStatus::Completed {
        return Err(DeskError::session_completed(session.id));
    }

    Ok(Some(SessionPatch {
        status: Some(SessionStatus::Completed),
        responder: Some(None),
        completed_at: Some(now),
        push_assignment: Some(AssignmentEvent {
            from: session.responder,
            to: None,
            reason: AssignmentReason::Completed,
            at: now,
        }),
        expect_status: Some(session.status),
        expect_responder: Some(session.responder),
        ..SessionPatch::new(now)
    }))
}
