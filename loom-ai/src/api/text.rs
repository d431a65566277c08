//! Text generation endpoints
//!
//! Every handler validates its task, assembles context, composes the prompt,
//! makes one provider call and records one usage entry.

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::governance::AuthenticatedUser;
use crate::prompts::{
    CanonChange, CanonDiff, CanonDiffParams, ExpandParams, GenerationTask, MergeProposal, MergeProposalParams,
    SuggestParams, SuggestionKind, SuggestionSet, TaskKind, DEFAULT_EXPAND_WORDS,
};
use crate::provider;
use crate::usage::UsageEntry;
use crate::AppState;

/// Output token ceiling for text tasks
const TEXT_MAX_TOKENS: u32 = 4_096;

fn default_num_suggestions() -> usize {
    3
}

fn default_target_words() -> u32 {
    DEFAULT_EXPAND_WORDS
}

#[derive(Debug, Deserialize)]
pub struct SuggestRequest {
    pub timeline_id: Uuid,
    pub node_id: Uuid,
    #[serde(default)]
    pub branch_id: Option<Uuid>,
    #[serde(default = "default_num_suggestions")]
    pub num_suggestions: usize,
    /// Overrides the profile's exploration ratio
    #[serde(default)]
    pub exploration_ratio: Option<f64>,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// A suggested child node, not yet saved to the graph
#[derive(Debug, Serialize)]
pub struct GhostNode {
    pub ghost_id: Uuid,
    pub parent_id: Uuid,
    pub title: String,
    pub content: String,
    pub kind: SuggestionKind,
    pub rationale: String,
}

#[derive(Debug, Serialize)]
pub struct SuggestResponse {
    pub suggestions: Vec<GhostNode>,
    pub exploratory: usize,
    pub aligned: usize,
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct ExpandRequest {
    pub timeline_id: Uuid,
    pub node_id: Uuid,
    #[serde(default)]
    pub branch_id: Option<Uuid>,
    #[serde(default = "default_target_words")]
    pub target_words: u32,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExpandResponse {
    pub node_id: Uuid,
    pub content: String,
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct CanonDiffRequest {
    pub timeline_id: Uuid,
    pub node_id: Uuid,
    #[serde(default)]
    pub branch_id: Option<Uuid>,
    /// Text to compare; the node's content when absent
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CanonDiffResponse {
    pub node_id: Uuid,
    pub changes: Vec<CanonChange>,
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub timeline_id: Uuid,
    /// Node whose branch is being merged in
    pub source_node_id: Uuid,
    /// Node whose path the merge continues
    pub target_node_id: Uuid,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MergeResponse {
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub title: String,
    pub content: String,
    pub reconciled_points: Vec<String>,
    pub model: String,
}

fn record_usage(state: &AppState, user_id: &str, kind: TaskKind, model: &str) {
    state.usage.record(UsageEntry {
        user_id: user_id.to_string(),
        endpoint: kind.as_str().to_string(),
        model: Some(model.to_string()),
    });
}

/// POST /api/ai/suggest
pub async fn suggest(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<SuggestRequest>,
) -> ApiResult<Json<SuggestResponse>> {
    let profile = state.assembler.creator_profile(&user_id).await;
    let params = SuggestParams {
        num_suggestions: request.num_suggestions,
        instructions: request.instructions,
        profile,
        exploration_ratio: request.exploration_ratio,
    };
    let split = params.split();
    let task = GenerationTask::Suggest(params);
    task.validate().map_err(ApiError::BadRequest)?;

    let ctx = state
        .assembler
        .build_context(request.timeline_id, request.node_id, request.branch_id)
        .await
        .map_err(|e| state.track(e))?;
    let prompt = task.compose(&ctx);

    let output = provider::generate_structured::<SuggestionSet>(
        state.provider.as_ref(),
        &prompt,
        None,
        Some(TEXT_MAX_TOKENS),
    )
    .await
    .map_err(|e| state.track(e))?;
    record_usage(&state, &user_id, task.kind(), &output.model);

    let suggestions = output
        .data
        .suggestions
        .into_iter()
        .map(|s| GhostNode {
            ghost_id: Uuid::new_v4(),
            parent_id: request.node_id,
            title: s.title,
            content: s.content,
            kind: s.kind,
            rationale: s.rationale,
        })
        .collect();

    Ok(Json(SuggestResponse {
        suggestions,
        exploratory: split.exploratory,
        aligned: split.aligned,
        model: output.model,
    }))
}

/// POST /api/ai/expand
pub async fn expand(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<ExpandRequest>,
) -> ApiResult<Json<ExpandResponse>> {
    let profile = state.assembler.creator_profile(&user_id).await;
    let task = GenerationTask::Expand(ExpandParams {
        target_words: request.target_words,
        instructions: request.instructions,
        profile,
    });
    task.validate().map_err(ApiError::BadRequest)?;

    let ctx = state
        .assembler
        .build_context(request.timeline_id, request.node_id, request.branch_id)
        .await
        .map_err(|e| state.track(e))?;

    let output = provider::generate_text(state.provider.as_ref(), &task.compose(&ctx), None, Some(TEXT_MAX_TOKENS))
        .await
        .map_err(|e| state.track(e))?;
    record_usage(&state, &user_id, task.kind(), &output.model);

    Ok(Json(ExpandResponse {
        node_id: request.node_id,
        content: output.text.trim().to_string(),
        model: output.model,
    }))
}

/// POST /api/ai/canon-diff
pub async fn canon_diff(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<CanonDiffRequest>,
) -> ApiResult<Json<CanonDiffResponse>> {
    let task = GenerationTask::CanonDiff(CanonDiffParams {
        content: request.content,
    });
    task.validate().map_err(ApiError::BadRequest)?;

    let ctx = state
        .assembler
        .build_context(request.timeline_id, request.node_id, request.branch_id)
        .await
        .map_err(|e| state.track(e))?;

    let output = provider::generate_structured::<CanonDiff>(
        state.provider.as_ref(),
        &task.compose(&ctx),
        None,
        Some(TEXT_MAX_TOKENS),
    )
    .await
    .map_err(|e| state.track(e))?;
    record_usage(&state, &user_id, task.kind(), &output.model);

    Ok(Json(CanonDiffResponse {
        node_id: request.node_id,
        changes: output.data.changes,
        model: output.model,
    }))
}

/// POST /api/ai/merge
pub async fn merge(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<MergeRequest>,
) -> ApiResult<Json<MergeResponse>> {
    if request.source_node_id == request.target_node_id {
        return Err(ApiError::BadRequest("source and target nodes must differ".to_string()));
    }

    let target_ctx = state
        .assembler
        .build_context(request.timeline_id, request.target_node_id, None)
        .await
        .map_err(|e| state.track(e))?;
    let source_ctx = state
        .assembler
        .build_context(request.timeline_id, request.source_node_id, None)
        .await
        .map_err(|e| state.track(e))?;

    let task = GenerationTask::MergeProposal(MergeProposalParams {
        incoming_path: source_ctx.active_path,
        instructions: request.instructions,
    });
    task.validate().map_err(ApiError::BadRequest)?;

    let output = provider::generate_structured::<MergeProposal>(
        state.provider.as_ref(),
        &task.compose(&target_ctx),
        None,
        Some(TEXT_MAX_TOKENS),
    )
    .await
    .map_err(|e| state.track(e))?;
    record_usage(&state, &user_id, task.kind(), &output.model);

    Ok(Json(MergeResponse {
        source_node_id: request.source_node_id,
        target_node_id: request.target_node_id,
        title: output.data.title,
        content: output.data.content,
        reconciled_points: output.data.reconciled_points,
        model: output.model,
    }))
}

/// Build text generation routes
pub fn text_routes() -> Router<AppState> {
    Router::new()
        .route("/api/ai/suggest", post(suggest))
        .route("/api/ai/expand", post(expand))
        .route("/api/ai/canon-diff", post(canon_diff))
        .route("/api/ai/merge", post(merge))
}
