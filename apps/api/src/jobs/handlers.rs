use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::info;

use crate::errors::AppError;
use crate::jobs::progress::ProgressView;
use crate::jobs::tracker::TrackerState;
use crate::models::job::JobKind;
use crate::remote::auth::SessionStatus;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct StartJobRequest {
    pub kind: JobKind,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Serialize)]
pub struct StartJobResponse {
    pub job_id: String,
}

#[derive(Serialize)]
pub struct CurrentJobResponse {
    pub tracker: TrackerState,
    pub progress: ProgressView,
}

#[derive(Deserialize)]
pub struct VisibilityRequest {
    pub visible: bool,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub status: SessionStatus,
}

fn current(state: &AppState) -> CurrentJobResponse {
    let tracker = state.tracker.snapshot();
    let progress = ProgressView::from_state(&tracker, Instant::now());
    CurrentJobResponse { tracker, progress }
}

/// POST /api/v1/jobs
pub async fn handle_start_job(
    State(state): State<AppState>,
    Json(req): Json<StartJobRequest>,
) -> Result<(StatusCode, Json<StartJobResponse>), AppError> {
    let parameters = if req.parameters.is_null() {
        Value::Object(Default::default())
    } else {
        req.parameters
    };
    let job_id = state.jobs.submit(req.kind, &parameters).await?;
    info!("Started {:?} job {job_id}", req.kind);

    state.tracker.start(
        &job_id,
        state.config.poll_interval,
        state.config.poll_timeout,
    )?;
    Ok((StatusCode::ACCEPTED, Json(StartJobResponse { job_id })))
}

/// GET /api/v1/jobs/current
pub async fn handle_current_job(State(state): State<AppState>) -> Json<CurrentJobResponse> {
    Json(current(&state))
}

/// POST /api/v1/jobs/current/stop
pub async fn handle_stop_job(State(state): State<AppState>) -> Json<CurrentJobResponse> {
    state.tracker.stop();
    Json(current(&state))
}

/// POST /api/v1/jobs/current/resume
/// Restarts tracking of the last known job; its first poll is the fresh status check.
pub async fn handle_resume_job(
    State(state): State<AppState>,
) -> Result<Json<CurrentJobResponse>, AppError> {
    let job_id = state
        .tracker
        .snapshot()
        .job_id
        .ok_or_else(|| AppError::NotFound("No job is being tracked".to_string()))?;

    state.tracker.start(
        &job_id,
        state.config.poll_interval,
        state.config.poll_timeout,
    )?;
    info!("Resumed tracking job {job_id}");
    Ok(Json(current(&state)))
}

/// DELETE /api/v1/jobs/current
pub async fn handle_clear_job(State(state): State<AppState>) -> StatusCode {
    state.tracker.clear().await;
    StatusCode::NO_CONTENT
}

/// POST /api/v1/visibility
pub async fn handle_visibility(
    State(state): State<AppState>,
    Json(req): Json<VisibilityRequest>,
) -> StatusCode {
    state.tracker.set_visible(req.visible);
    StatusCode::NO_CONTENT
}

/// GET /api/v1/session
pub async fn handle_session(State(state): State<AppState>) -> Json<SessionResponse> {
    Json(SessionResponse {
        status: state.auth.status(),
    })
}
