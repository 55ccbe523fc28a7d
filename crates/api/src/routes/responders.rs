//! Responder directory routes (staff dashboard)

use axum::{
    extract::{Path, State},
    Json,
};
use livedesk_shared::{ResponderAvailability, ResponderId};
use serde::{Deserialize, Serialize};

use crate::{
    desk::ResponderWorkload,
    directory::AvailabilityUpdate,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponderListResponse {
    pub responders: Vec<ResponderWorkload>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponderRequest {
    pub display_name: String,
    pub capacity: u32,
    #[serde(default = "default_true")]
    pub on_call: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Current load vs. capacity for every responder
pub async fn list_responders(
    State(state): State<AppState>,
) -> ApiResult<Json<ResponderListResponse>> {
    let responders = state.desk.responder_workload().await?;
    Ok(Json(ResponderListResponse { responders }))
}

/// Create or update a responder; load and assignment history are kept
pub async fn register_responder(
    State(state): State<AppState>,
    Path(responder_id): Path<ResponderId>,
    Json(req): Json<RegisterResponderRequest>,
) -> ApiResult<Json<ResponderAvailability>> {
    if req.capacity == 0 {
        return Err(ApiError::Validation("capacity must be at least 1".into()));
    }

    let mut responder = ResponderAvailability::new(responder_id, req.display_name, req.capacity);
    responder.on_call = req.on_call;
    responder.active = req.active;

    Ok(Json(state.desk.register_responder(responder).await?))
}

pub async fn set_availability(
    State(state): State<AppState>,
    Path(responder_id): Path<ResponderId>,
    Json(req): Json<AvailabilityUpdate>,
) -> ApiResult<Json<ResponderAvailability>> {
    if req.on_call.is_none() && req.active.is_none() {
        return Err(ApiError::BadRequest(
            "at least one of on_call or active is required".into(),
        ));
    }
    Ok(Json(state.desk.set_availability(responder_id, req).await?))
}
