//! Image generation endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::governance::AuthenticatedUser;
use crate::jobs::{SubmitOutcome, SubmitRequest, SubmitStatus};
use crate::prompts::{GenerationTask, PortraitParams};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateImageRequest {
    pub node_id: Uuid,
    pub timeline_id: Uuid,
    /// Scene direction; the node's own text is used when empty
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct PortraitRequest {
    pub timeline_id: Uuid,
    /// Branch whose canon tone colors the portrait
    #[serde(default)]
    pub branch_id: Option<Uuid>,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub style: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PortraitResponse {
    pub name: String,
    pub image_url: String,
    pub model: String,
    pub reference_updated: bool,
}

#[derive(Debug, Serialize)]
pub struct NodeImageResponse {
    pub node_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// POST /api/images/generate
///
/// 202 with a job id when queued, 200 when the image is already available.
pub async fn generate_image(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<GenerateImageRequest>,
) -> ApiResult<(StatusCode, Json<SubmitOutcome>)> {
    let outcome = state
        .orchestrator
        .submit(SubmitRequest {
            node_id: request.node_id,
            timeline_id: request.timeline_id,
            prompt: request.prompt,
            user_id,
        })
        .await
        .map_err(|e| state.track(e))?;

    let status = match outcome.status {
        SubmitStatus::Queued => StatusCode::ACCEPTED,
        SubmitStatus::Completed | SubmitStatus::AlreadyExists => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// POST /api/images/portrait
pub async fn generate_portrait(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<PortraitRequest>,
) -> ApiResult<Json<PortraitResponse>> {
    let params = PortraitParams {
        name: request.name,
        description: request.description,
        style: request.style,
    };
    GenerationTask::PortraitImage(params.clone())
        .validate()
        .map_err(ApiError::BadRequest)?;
    let name = params.name.trim().to_string();

    let result = state
        .orchestrator
        .executor()
        .render_portrait(request.timeline_id, request.branch_id, params, &user_id)
        .await
        .map_err(|e| state.track(e))?;

    Ok(Json(PortraitResponse {
        name,
        image_url: result.image_url,
        model: result.model,
        reference_updated: result.reference_updated,
    }))
}

/// GET /api/timelines/:timeline_id/nodes/:node_id/image
pub async fn node_image(
    State(state): State<AppState>,
    Path((timeline_id, node_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<NodeImageResponse>> {
    let node = state
        .store
        .get_node(timeline_id, node_id)
        .await
        .map_err(|e| state.track(e))?
        .ok_or_else(|| ApiError::NotFound(format!("node {} in timeline {}", node_id, timeline_id)))?;

    Ok(Json(NodeImageResponse {
        node_id,
        image_url: node.image_url,
    }))
}

/// Build image routes
pub fn image_routes() -> Router<AppState> {
    Router::new()
        .route("/api/images/generate", post(generate_image))
        .route("/api/images/portrait", post(generate_portrait))
        .route("/api/timelines/:timeline_id/nodes/:node_id/image", get(node_image))
}
