//! Fixed-interval polling loop for one viewer

use std::sync::Arc;
use std::time::Duration;

use livedesk_shared::{ChatSession, SessionFilter, SessionId, SessionStatus};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{SessionSource, SyncError, ViewerContext, ViewerRole};
use livedesk_shared::DeskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    /// Consecutive failed polls before connectivity is reported degraded
    pub degraded_after: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3000),
            degraded_after: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Connectivity {
    /// No poll has completed yet
    #[default]
    Connecting,
    Online,
    Degraded { consecutive_failures: u32 },
}

/// A message shown optimistically before the server has confirmed it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMessage {
    pub session_id: SessionId,
    pub dedup_token: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub queued_at: OffsetDateTime,
    /// `false` once the post has failed; dropped on the next poll
    pub in_flight: bool,
}

/// Everything a viewer renders
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewerSnapshot {
    pub sessions: Vec<ChatSession>,
    pub pending: Vec<PendingMessage>,
    pub connectivity: Connectivity,
    pub consecutive_failures: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_synced_at: Option<OffsetDateTime>,
    pub ticks: u64,
}

impl ViewerSnapshot {
    pub fn session(&self, id: SessionId) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    fn confirms(&self, pending: &PendingMessage) -> bool {
        self.session(pending.session_id)
            .is_some_and(|s| s.find_by_dedup_token(&pending.dedup_token).is_some())
    }

    fn replace_session(&mut self, session: ChatSession) {
        match self.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// A client viewer's session reached `completed`
    SessionCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    SessionCompleted,
}

pub struct SyncLoop {
    viewer: ViewerContext,
    source: Arc<dyn SessionSource>,
    config: SyncConfig,
    state: watch::Sender<ViewerSnapshot>,
}

impl SyncLoop {
    pub fn new(viewer: ViewerContext, source: Arc<dyn SessionSource>, config: SyncConfig) -> Self {
        let (state, _) = watch::channel(ViewerSnapshot::default());
        Self {
            viewer,
            source,
            config,
            state,
        }
    }

    pub fn viewer(&self) -> &ViewerContext {
        &self.viewer
    }

    pub fn snapshot(&self) -> ViewerSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewerSnapshot> {
        self.state.subscribe()
    }

    /// Poll once and replace the local state with the result
    pub async fn tick(&self) -> Result<TickOutcome, SyncError> {
        match self.fetch().await {
            Ok(sessions) => {
                let completed = matches!(self.viewer.role, ViewerRole::Client { .. })
                    && !sessions.is_empty()
                    && sessions.iter().all(|s| s.status == SessionStatus::Completed);
                let now = OffsetDateTime::now_utc();

                self.state.send_modify(|snapshot| {
                    snapshot.sessions = sessions;
                    let pending = std::mem::take(&mut snapshot.pending);
                    snapshot.pending = pending
                        .into_iter()
                        .filter(|p| p.in_flight && !snapshot.confirms(p))
                        .collect();
                    snapshot.connectivity = Connectivity::Online;
                    snapshot.consecutive_failures = 0;
                    snapshot.last_synced_at = Some(now);
                    snapshot.ticks += 1;
                });

                Ok(if completed {
                    TickOutcome::SessionCompleted
                } else {
                    TickOutcome::Continue
                })
            }
            Err(err) => {
                let degraded_after = self.config.degraded_after;
                self.state.send_modify(|snapshot| {
                    snapshot.consecutive_failures += 1;
                    snapshot.ticks += 1;
                    if snapshot.consecutive_failures >= degraded_after {
                        snapshot.connectivity = Connectivity::Degraded {
                            consecutive_failures: snapshot.consecutive_failures,
                        };
                    }
                });
                tracing::warn!(
                    viewer_id = %self.viewer.viewer_id,
                    error = %err,
                    "Sync poll failed, retrying next tick"
                );
                Err(err)
            }
        }
    }

    /// Post into the viewer's own session (client viewers)
    pub async fn send(&self, content: impl Into<String>) -> Result<ChatSession, SyncError> {
        let session_id = self.viewer.session_id().ok_or_else(|| {
            SyncError::Desk(DeskError::Validation(
                "staff viewers must name the session to post into".to_string(),
            ))
        })?;
        self.send_to(session_id, content).await
    }

    /// Show the message optimistically, post it, then apply the server's copy
    pub async fn send_to(
        &self,
        session_id: SessionId,
        content: impl Into<String>,
    ) -> Result<ChatSession, SyncError> {
        let content = content.into();
        let dedup_token = Uuid::new_v4().to_string();
        let message = self.viewer.compose(content.clone(), dedup_token.clone());

        self.state.send_modify(|snapshot| {
            snapshot.pending.push(PendingMessage {
                session_id,
                dedup_token: dedup_token.clone(),
                content,
                queued_at: OffsetDateTime::now_utc(),
                in_flight: true,
            });
        });
        // Marks the entry failed unless the post succeeds and removes it
        let _in_flight = InFlight {
            state: &self.state,
            dedup_token: &dedup_token,
        };

        match self.source.post_message(session_id, message).await {
            Ok(session) => {
                self.state.send_modify(|snapshot| {
                    snapshot.pending.retain(|p| p.dedup_token != dedup_token);
                    snapshot.replace_session(session.clone());
                });
                Ok(session)
            }
            Err(err) => {
                tracing::warn!(
                    viewer_id = %self.viewer.viewer_id,
                    session_id = %session_id,
                    error = %err,
                    "Message post failed"
                );
                Err(err)
            }
        }
    }

    /// Start polling in the background
    pub fn spawn(self) -> SyncHandle {
        let cancel = CancellationToken::new();
        let sync = Arc::new(self);
        let task = {
            let sync = sync.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sync.run(cancel).await })
        };

        SyncHandle {
            changes: sync.subscribe(),
            sync,
            cancel,
            task: Some(task),
        }
    }

    async fn fetch(&self) -> Result<Vec<ChatSession>, SyncError> {
        match self.viewer.role {
            ViewerRole::Client { session_id, .. } => {
                Ok(vec![self.source.fetch_session(session_id).await?])
            }
            ViewerRole::Staff { responder_id } => {
                self.source
                    .fetch_sessions(&SessionFilter::staff_queue(responder_id))
                    .await
            }
        }
    }

    async fn run(&self, cancel: CancellationToken) -> StopReason {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(viewer_id = %self.viewer.viewer_id, "Sync loop started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(viewer_id = %self.viewer.viewer_id, "Sync loop cancelled");
                    return StopReason::Cancelled;
                }
                _ = interval.tick() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            tracing::debug!(viewer_id = %self.viewer.viewer_id, "Sync loop cancelled mid-poll");
                            return StopReason::Cancelled;
                        }
                        outcome = self.tick() => {
                            if let Ok(TickOutcome::SessionCompleted) = outcome {
                                tracing::info!(viewer_id = %self.viewer.viewer_id, "Session completed, sync loop finished");
                                return StopReason::SessionCompleted;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Flips a pending message to failed when its post does not complete,
/// including when the sending future is dropped.
struct InFlight<'a> {
    state: &'a watch::Sender<ViewerSnapshot>,
    dedup_token: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|snapshot| {
            if let Some(p) = snapshot
                .pending
                .iter_mut()
                .find(|p| p.dedup_token == self.dedup_token)
            {
                p.in_flight = false;
            }
        });
    }
}

/// Owner of a running [`SyncLoop`]. Dropping it stops the loop.
pub struct SyncHandle {
    sync: Arc<SyncLoop>,
    changes: watch::Receiver<ViewerSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<StopReason>>,
}

impl SyncHandle {
    pub fn snapshot(&self) -> ViewerSnapshot {
        self.sync.snapshot()
    }

    /// Receiver that wakes on every state change
    pub fn changes(&self) -> watch::Receiver<ViewerSnapshot> {
        self.changes.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Wait for the loop to end on its own
    pub async fn join(mut self) -> Option<StopReason> {
        let task = self.task.take()?;
        task.await.ok()
    }

    pub async fn shutdown(self) -> Option<StopReason> {
        self.stop();
        self.join().await
    }

    pub async fn send(&self, content: impl Into<String>) -> Result<ChatSession, SyncError> {
        self.sync.send(content).await
    }

    pub async fn send_to(
        &self,
        session_id: SessionId,
        content: impl Into<String>,
    ) -> Result<ChatSession, SyncError> {
        self.sync.send_to(session_id, content).await
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
