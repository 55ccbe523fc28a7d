//! In-memory responder directory

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use livedesk_shared::{ResponderAvailability, ResponderId};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{
    check_target, AvailabilityUpdate, DirectoryError, LoadChange, OperationToken,
    ResponderDirectory, ResponderFilter,
};

#[derive(Default)]
struct DirectoryState {
    responders: HashMap<ResponderId, ResponderAvailability>,
    /// Applied tokens and when they were recorded
    applied: HashMap<String, OffsetDateTime>,
}

impl DirectoryState {
    fn record(&mut self, token: &OperationToken) {
        self.applied
            .insert(token.as_str().to_string(), OffsetDateTime::now_utc());
    }
}

#[derive(Clone, Default)]
pub struct MemoryResponderDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MemoryResponderDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory pre-populated with the given responders
    pub fn with_responders(responders: impl IntoIterator<Item = ResponderAvailability>) -> Self {
        let state = DirectoryState {
            responders: responders.into_iter().map(|r| (r.id, r)).collect(),
            applied: HashMap::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

#[async_trait]
impl ResponderDirectory for MemoryResponderDirectory {
    async fn list(
        &self,
        filter: &ResponderFilter,
    ) -> Result<Vec<ResponderAvailability>, DirectoryError> {
        let state = self.state.lock().await;
        let mut responders: Vec<ResponderAvailability> = state
            .responders
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        responders.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(responders)
    }

    async fn get(&self, id: ResponderId) -> Result<ResponderAvailability, DirectoryError> {
        let state = self.state.lock().await;
        state
            .responders
            .get(&id)
            .cloned()
            .ok_or(DirectoryError::NotFound(id))
    }

    async fn upsert(
        &self,
        mut responder: ResponderAvailability,
    ) -> Result<ResponderAvailability, DirectoryError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.responders.get(&responder.id) {
            responder.load = existing.load;
            responder.last_assigned_at = existing.last_assigned_at;
        }
        state.responders.insert(responder.id, responder.clone());
        Ok(responder)
    }

    async fn set_availability(
        &self,
        id: ResponderId,
        update: AvailabilityUpdate,
    ) -> Result<ResponderAvailability, DirectoryError> {
        let mut state = self.state.lock().await;
        let responder = state
            .responders
            .get_mut(&id)
            .ok_or(DirectoryError::NotFound(id))?;
        if let Some(on_call) = update.on_call {
            responder.on_call = on_call;
        }
        if let Some(active) = update.active {
            responder.active = active;
        }
        Ok(responder.clone())
    }

    async fn increment_load(
        &self,
        id: ResponderId,
        expected_load: u32,
        token: &OperationToken,
        now: OffsetDateTime,
    ) -> Result<LoadChange, DirectoryError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.applied.contains_key(token.as_str()) {
            return Ok(LoadChange::AlreadyApplied);
        }

        let responder = state
            .responders
            .get_mut(&id)
            .ok_or(DirectoryError::NotFound(id))?;
        check_target(responder, Some(expected_load))?;

        responder.load += 1;
        responder.last_assigned_at = Some(now);
        let snapshot = responder.clone();
        state.record(token);
        Ok(LoadChange::Applied(snapshot))
    }

    async fn decrement_load(
        &self,
        id: ResponderId,
        token: &OperationToken,
    ) -> Result<LoadChange, DirectoryError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.applied.contains_key(token.as_str()) {
            return Ok(LoadChange::AlreadyApplied);
        }

        let responder = state
            .responders
            .get_mut(&id)
            .ok_or(DirectoryError::NotFound(id))?;
        if responder.load == 0 {
            tracing::warn!(responder_id = %id, token = %token, "Load release on idle responder");
        }
        responder.load = responder.load.saturating_sub(1);
        let snapshot = responder.clone();
        state.record(token);
        Ok(LoadChange::Applied(snapshot))
    }

    async fn transfer_load(
        &self,
        from: Option<ResponderId>,
        to: ResponderId,
        expected_to_load: Option<u32>,
        token: &OperationToken,
        now: OffsetDateTime,
    ) -> Result<LoadChange, DirectoryError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.applied.contains_key(token.as_str()) {
            return Ok(LoadChange::AlreadyApplied);
        }

        // Validate both sides before touching either counter
        let target = state
            .responders
            .get(&to)
            .ok_or(DirectoryError::NotFound(to))?;
        check_target(target, expected_to_load)?;
        if let Some(from) = from {
            if !state.responders.contains_key(&from) {
                return Err(DirectoryError::NotFound(from));
            }
        }

        if let Some(from) = from {
            if let Some(source) = state.responders.get_mut(&from) {
                source.load = source.load.saturating_sub(1);
            }
        }
        let target = state
            .responders
            .get_mut(&to)
            .ok_or(DirectoryError::NotFound(to))?;
        target.load += 1;
        target.last_assigned_at = Some(now);
        let snapshot = target.clone();
        state.record(token);
        Ok(LoadChange::Applied(snapshot))
    }

    async fn prune_operations(&self, older_than: OffsetDateTime) -> Result<u64, DirectoryError> {
        let mut state = self.state.lock().await;
        let before = state.applied.len();
        state.applied.retain(|_, applied_at| *applied_at >= older_than);
        Ok((before - state.applied.len()) as u64)
    }
}
