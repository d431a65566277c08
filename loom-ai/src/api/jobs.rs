//! Job status endpoint

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::jobs::JobStatusView;
use crate::AppState;

/// GET /api/jobs/:job_id
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobStatusView>> {
    let view = state
        .orchestrator
        .job_status(job_id)
        .await
        .map_err(|e| state.track(e))?;
    Ok(Json(view))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new().route("/api/jobs/:job_id", get(job_status))
}
