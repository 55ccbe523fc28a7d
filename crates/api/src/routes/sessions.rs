//! Chat session routes
//!
//! Thin adapters over [`ChatService`](crate::desk::ChatService): parse the
//! request, call one desk operation, render the authoritative session.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use livedesk_shared::{
    ChatSession, ClientId, DeskError, ResponderId, ResponderRef, SenderType, SessionFilter,
    SessionId, SessionSort, SessionStatus,
};
use serde::{Deserialize, Serialize};

use crate::{
    desk::{NewMessage, StartSession, StartedSession},
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ListSessionsQuery {
    pub client_id: Option<ClientId>,
    pub responder_id: Option<ResponderId>,
    /// Sessions handled by the automated responder
    pub automated: Option<bool>,
    pub include_waiting: Option<bool>,
    /// Comma-separated statuses, e.g. `waiting,active`
    pub status: Option<String>,
    pub sort: Option<SessionSort>,
    pub limit: Option<usize>,
}

impl ListSessionsQuery {
    fn filter(&self) -> ApiResult<SessionFilter> {
        let responder = match (self.responder_id, self.automated.unwrap_or(false)) {
            (Some(_), true) => {
                return Err(ApiError::BadRequest(
                    "responder_id and automated are mutually exclusive".into(),
                ))
            }
            (Some(id), false) => Some(ResponderRef::Human(id)),
            (None, true) => Some(ResponderRef::Automated),
            (None, false) => None,
        };

        let statuses = match &self.status {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<SessionStatus>())
                .collect::<Result<Vec<_>, DeskError>>()?,
            None => Vec::new(),
        };

        Ok(SessionFilter {
            client_id: self.client_id,
            responder,
            include_waiting: self.include_waiting.unwrap_or(false),
            statuses,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<ChatSession>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub responder_id: ResponderId,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_responder_id: ResponderId,
    #[serde(default)]
    pub to_responder_id: Option<ResponderId>,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub reader: SenderType,
    pub up_to_seq: i64,
}

// =============================================================================
// Handlers
// =============================================================================

/// Start a session, or return the client's open one (200 instead of 201)
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSession>,
) -> ApiResult<(StatusCode, Json<StartedSession>)> {
    let started = state.desk.start_session(req).await?;
    let status = if started.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(started)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<Json<ChatSession>> {
    Ok(Json(state.desk.poll_session(session_id).await?))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Json<SessionListResponse>> {
    let filter = query.filter()?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let sessions = state
        .desk
        .poll_sessions(&filter, query.sort.unwrap_or_default(), limit)
        .await?;
    Ok(Json(SessionListResponse { sessions }))
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<NewMessage>,
) -> ApiResult<Json<ChatSession>> {
    Ok(Json(state.desk.post_message(session_id, req).await?))
}

pub async fn claim_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Json<ChatSession>> {
    Ok(Json(
        state
            .desk
            .claim_session(session_id, req.responder_id)
            .await?,
    ))
}

pub async fn transfer_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Json<ChatSession>> {
    Ok(Json(
        state
            .desk
            .transfer_session(session_id, req.from_responder_id, req.to_responder_id)
            .await?,
    ))
}

pub async fn complete_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<Json<ChatSession>> {
    Ok(Json(state.desk.complete_session(session_id).await?))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<Json<ChatSession>> {
    Ok(Json(
        state
            .desk
            .mark_read(session_id, req.reader, req.up_to_seq)
            .await?,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_list_query_builds_filter() {
        let responder = ResponderId::new();
        let query = ListSessionsQuery {
            responder_id: Some(responder),
            include_waiting: Some(true),
            status: Some("waiting, active".into()),
            ..Default::default()
        };
        let filter = query.filter().unwrap();
        assert_eq!(filter, SessionFilter::staff_queue(responder));
    }

    #[test]
    fn test_list_query_rejects_bad_input() {
        let bad_status = ListSessionsQuery {
            status: Some("open".into()),
            ..Default::default()
        };
        assert!(matches!(bad_status.filter(), Err(ApiError::Validation(_))));

        let both = ListSessionsQuery {
            responder_id: Some(ResponderId::new()),
            automated: Some(true),
            ..Default::default()
        };
        assert!(matches!(both.filter(), Err(ApiError::BadRequest(_))));
    }
}
