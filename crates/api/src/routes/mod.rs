//! API routes

pub mod health;
pub mod responders;
pub mod sessions;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post, put},
    Router,
};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let session_routes = Router::new()
        .route(
            "/sessions",
            post(sessions::start_session).get(sessions::list_sessions),
        )
        .route("/sessions/:id", get(sessions::get_session))
        .route("/sessions/:id/messages", post(sessions::post_message))
        .route("/sessions/:id/claim", post(sessions::claim_session))
        .route("/sessions/:id/transfer", post(sessions::transfer_session))
        .route("/sessions/:id/complete", post(sessions::complete_session))
        .route("/sessions/:id/read", post(sessions::mark_read));

    let responder_routes = Router::new()
        .route("/responders", get(responders::list_responders))
        .route("/responders/:id", put(responders::register_responder))
        .route(
            "/responders/:id/availability",
            patch(responders::set_availability),
        );

    // Combine all routes
    Router::new()
        .merge(health_routes)
        .nest("/api/v1", session_routes.merge(responder_routes))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
