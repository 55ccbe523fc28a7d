//! Assignment policy
//!
//! Candidates are on-call, active responders below capacity, ranked by
//! current load, then least-recently-assigned (never-assigned first), then
//! id. Reserving a candidate is a compare-and-swap on its load counter; a
//! lost race moves on to the next candidate and an exhausted list is
//! re-snapshotted a bounded number of times.

use std::sync::Arc;

use livedesk_shared::{
    ChatSession, DeskError, DeskResult, ResponderAvailability, ResponderId, ResponderRef,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::directory::{
    DirectoryError, LoadChange, OperationToken, ResponderDirectory, ResponderFilter,
};

/// Order eligible candidates best-first, dropping `exclude`
pub fn rank_candidates(
    candidates: Vec<ResponderAvailability>,
    exclude: Option<ResponderId>,
) -> Vec<ResponderAvailability> {
    let mut ranked: Vec<ResponderAvailability> = candidates
        .into_iter()
        .filter(|r| r.is_eligible() && Some(r.id) != exclude)
        .collect();
    // `None < Some(_)`, so never-assigned responders come first
    ranked.sort_by(|a, b| {
        a.load
            .cmp(&b.load)
            .then_with(|| a.last_assigned_at.cmp(&b.last_assigned_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// What a reservation moved, so it can be undone if the session update loses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationKind {
    Assign,
    Transfer { from: ResponderRef },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub responder: ResponderId,
    pub kind: ReservationKind,
    /// Scopes the reservation's tokens so only its holder can undo it
    pub id: Uuid,
    /// `false` when the directory had already applied this token
    pub applied: bool,
}

pub struct AssignmentPolicy {
    directory: Arc<dyn ResponderDirectory>,
    max_attempts: u32,
}

impl AssignmentPolicy {
    pub fn new(directory: Arc<dyn ResponderDirectory>, max_attempts: u32) -> Self {
        Self {
            directory,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Reserve one unit of load on the best available responder.
    ///
    /// `Ok(None)` means nobody can take the session right now.
    pub async fn reserve_best(
        &self,
        session: &ChatSession,
        now: OffsetDateTime,
    ) -> DeskResult<Option<Reservation>> {
        let id = Uuid::new_v4();

        for attempt in 1..=self.max_attempts {
            let ranked = rank_candidates(self.directory.list(&ResponderFilter::eligible()).await?, None);
            if ranked.is_empty() {
                tracing::debug!(session_id = %session.id, "No eligible responders");
                return Ok(None);
            }

            for candidate in ranked {
                let token = OperationToken::assign(session.id, candidate.id, id);
                match self
                    .directory
                    .increment_load(candidate.id, candidate.load, &token, now)
                    .await
                {
                    Ok(change) => {
                        tracing::debug!(
                            session_id = %session.id,
                            responder_id = %candidate.id,
                            load = candidate.load + 1,
                            capacity = candidate.capacity,
                            "Responder reserved"
                        );
                        return Ok(Some(Reservation {
                            responder: candidate.id,
                            kind: ReservationKind::Assign,
                            id,
                            applied: change.was_applied(),
                        }));
                    }
                    Err(err) if is_contention(&err) => {
                        tracing::debug!(
                            session_id = %session.id,
                            responder_id = %candidate.id,
                            error = %err,
                            "Candidate unavailable, trying next"
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            tracing::debug!(
                session_id = %session.id,
                attempt,
                "Candidates exhausted, re-reading directory"
            );
        }

        Ok(None)
    }

    /// Reserve load on a specific responder (staff claim)
    pub async fn reserve_target(
        &self,
        session: &ChatSession,
        target: ResponderId,
        now: OffsetDateTime,
    ) -> DeskResult<Reservation> {
        let id = Uuid::new_v4();
        let token = OperationToken::assign(session.id, target, id);

        for _ in 0..self.max_attempts {
            let current = self.directory.get(target).await?;
            match self
                .directory
                .increment_load(target, current.load, &token, now)
                .await
            {
                Ok(change) => {
                    return Ok(Reservation {
                        responder: target,
                        kind: ReservationKind::Assign,
                        id,
                        applied: change.was_applied(),
                    })
                }
                Err(DirectoryError::LoadChanged { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(DeskError::Conflict(format!(
            "responder {} load kept changing",
            target
        )))
    }

    /// Move the session's unit of load from `from` to `target` (or the best
    /// other responder when no target is named).
    pub async fn reserve_transfer(
        &self,
        session: &ChatSession,
        from: ResponderRef,
        target: Option<ResponderId>,
        now: OffsetDateTime,
    ) -> DeskResult<Reservation> {
        let id = Uuid::new_v4();
        let from_human = from.human_id();

        if let Some(target) = target {
            for _ in 0..self.max_attempts {
                let current = self.directory.get(target).await?;
                let token = OperationToken::transfer(session.id, from, target, id);
                match self
                    .directory
                    .transfer_load(from_human, target, Some(current.load), &token, now)
                    .await
                {
                    Ok(change) => {
                        return Ok(self.transfer_reservation(target, from, id, change))
                    }
                    Err(DirectoryError::LoadChanged { .. }) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            return Err(DeskError::Conflict(format!(
                "responder {} load kept changing",
                target
            )));
        }

        for attempt in 1..=self.max_attempts {
            let ranked = rank_candidates(
                self.directory.list(&ResponderFilter::eligible()).await?,
                from_human,
            );
            if ranked.is_empty() {
                break;
            }

            for candidate in ranked {
                let token = OperationToken::transfer(session.id, from, candidate.id, id);
                match self
                    .directory
                    .transfer_load(from_human, candidate.id, Some(candidate.load), &token, now)
                    .await
                {
                    Ok(change) => {
                        return Ok(self.transfer_reservation(candidate.id, from, id, change))
                    }
                    Err(err) if is_contention(&err) => continue,
                    Err(err) => return Err(err.into()),
                }
            }

            tracing::debug!(
                session_id = %session.id,
                attempt,
                "Transfer candidates exhausted, re-reading directory"
            );
        }

        Err(DeskError::Capacity(format!(
            "no other responder has spare capacity for session {}",
            session.id
        )))
    }

    /// Undo a reservation whose session update lost its race
    pub async fn compensate(&self, session: &ChatSession, reservation: Reservation) {
        if !reservation.applied {
            return;
        }

        let result = match reservation.kind {
            ReservationKind::Assign => {
                let token = OperationToken::undo_assign(
                    session.id,
                    reservation.responder,
                    reservation.id,
                );
                self.directory
                    .decrement_load(reservation.responder, &token)
                    .await
            }
            ReservationKind::Transfer { from } => {
                let token = OperationToken::revert_transfer(
                    session.id,
                    from,
                    reservation.responder,
                    reservation.id,
                );
                match from.human_id() {
                    Some(original) => {
                        self.directory
                            .transfer_load(
                                Some(reservation.responder),
                                original,
                                None,
                                &token,
                                OffsetDateTime::now_utc(),
                            )
                            .await
                    }
                    None => {
                        self.directory
                            .decrement_load(reservation.responder, &token)
                            .await
                    }
                }
            }
        };

        match result {
            Ok(_) => tracing::warn!(
                session_id = %session.id,
                responder_id = %reservation.responder,
                "Session update lost a race, reservation released"
            ),
            Err(err) => tracing::error!(
                session_id = %session.id,
                responder_id = %reservation.responder,
                error = %err,
                "Failed to release reservation, responder load may be overstated"
            ),
        }
    }

    /// Return the load a completed session held on its human responder
    pub async fn release_on_completion(&self, session: &ChatSession, responder: ResponderId) {
        let token = OperationToken::release(session.id, responder, session.assignment_epoch());
        if let Err(err) = self.directory.decrement_load(responder, &token).await {
            tracing::error!(
                session_id = %session.id,
                responder_id = %responder,
                error = %err,
                "Failed to release responder load on completion"
            );
        }
    }

    fn transfer_reservation(
        &self,
        target: ResponderId,
        from: ResponderRef,
        id: Uuid,
        change: LoadChange,
    ) -> Reservation {
        Reservation {
            responder: target,
            kind: ReservationKind::Transfer { from },
            id,
            applied: change.was_applied(),
        }
    }
}

/// Errors that mean "try someone else" rather than "give up"
fn is_contention(err: &DirectoryError) -> bool {
    matches!(
        err,
        DirectoryError::LoadChanged { .. }
            | DirectoryError::AtCapacity(_)
            | DirectoryError::Ineligible(_)
            | DirectoryError::NotFound(_)
    )
}
