//! Waiting-session sweeper
//!
//! Sessions nobody polls would otherwise sit in `waiting` forever. The sweep
//! re-runs routing and the automated fallback over a batch of waiting
//! sessions, highest priority and oldest first.

use std::sync::Arc;
use std::time::Duration;

use livedesk_shared::{DeskResult, ResponderRef, SessionFilter, SessionSort, SessionStatus};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ChatService;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub assigned: usize,
    pub automated: usize,
    pub still_waiting: usize,
    pub failed: usize,
}

/// Reconcile up to `batch` waiting sessions
pub async fn sweep_waiting_sessions(desk: &ChatService, batch: usize) -> DeskResult<SweepReport> {
    let waiting = desk
        .poll_sessions(&SessionFilter::waiting(), SessionSort::QueueOrder, batch)
        .await?;

    let mut report = SweepReport::default();
    for session in waiting {
        report.examined += 1;
        match desk.reconcile_waiting(session.id).await {
            Ok(updated) => match (updated.status, updated.responder) {
                (SessionStatus::Active, Some(ResponderRef::Automated)) => report.automated += 1,
                (SessionStatus::Active, _) => report.assigned += 1,
                (SessionStatus::Waiting, _) => report.still_waiting += 1,
                // Completed by someone else in the meantime
                (SessionStatus::Completed, _) => {}
            },
            Err(e) => {
                report.failed += 1;
                tracing::warn!(session_id = %session.id, error = %e, "Failed to reconcile waiting session");
            }
        }
    }

    // Housekeeping runs on every sweep, including an empty queue
    desk.prune_locks();
    if let Err(e) = desk.prune_operation_log().await {
        tracing::warn!(error = %e, "Failed to prune load-change tokens");
    }

    if report.examined == 0 {
        return Ok(report);
    }

    tracing::info!(
        examined = report.examined,
        assigned = report.assigned,
        automated = report.automated,
        still_waiting = report.still_waiting,
        failed = report.failed,
        "Waiting-session sweep finished"
    );
    Ok(report)
}

/// Run the sweep on a fixed interval inside the API process until `cancel` fires
pub fn spawn_embedded_sweeper(
    desk: Arc<ChatService>,
    every: Duration,
    batch: usize,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Embedded sweeper stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = sweep_waiting_sessions(&desk, batch).await {
                        tracing::error!(error = %e, "Waiting-session sweep failed");
                    }
                }
            }
        }
    })
}

/// Cancel the embedded sweeper and wait for it. Returns `false` if the task panicked.
pub async fn stop_embedded_sweeper(handle: JoinHandle<()>, cancel: &CancellationToken) -> bool {
    cancel.cancel();
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "Embedded sweeper task failed");
            false
        }
    }
}
