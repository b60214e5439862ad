use axum::{
    routing::{delete, get},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Transfers
        .route("/jobs", get(handlers::list_jobs))
        .route("/jobs/:owner_id", get(handlers::get_job))
        .route("/jobs/:owner_id", delete(handlers::cancel_job))
        // Internal
        .route("/_internal/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
