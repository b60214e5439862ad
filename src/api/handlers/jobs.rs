use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::api::response::{ApiError, JSend};
use crate::transfer::{CancelOutcome, JobSnapshot, OwnerId};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<JobSnapshot>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub owner_id: OwnerId,
    pub cancelled: bool,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<JSend<JobList>> {
    let mut jobs = state.relay.active();
    jobs.sort_by_key(|job| job.started_at);
    JSend::success(JobList {
        total: jobs.len(),
        jobs,
    })
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<OwnerId>,
) -> Result<Json<JSend<JobSnapshot>>, ApiError> {
    state
        .relay
        .status(&owner_id)
        .map(JSend::success)
        .ok_or_else(|| ApiError::not_found(format!("No active upload for {owner_id}")))
}

/// Signals cancellation. The job unwinds asynchronously, hence 202.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<OwnerId>,
) -> Result<(StatusCode, Json<JSend<CancelResponse>>), ApiError> {
    match state.relay.cancel(&owner_id) {
        CancelOutcome::Signalled => Ok((
            StatusCode::ACCEPTED,
            JSend::success(CancelResponse {
                owner_id,
                cancelled: true,
            }),
        )),
        CancelOutcome::NotFound => Err(ApiError::not_found(format!(
            "No active upload for {owner_id}"
        ))),
    }
}
