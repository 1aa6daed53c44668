use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use cv_core::task_store::TaskFilter;
use cv_core::types::{AgentId, NewTask, Task, VerificationResult};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::state::ApiState;
use crate::api_error::ApiError;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Body of every ownership-scoped task operation.
#[derive(Debug, Deserialize)]
pub(crate) struct AgentRequest {
    agent_id: AgentId,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProgressRequest {
    agent_id: AgentId,
    #[serde(default)]
    note: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BlockRequest {
    agent_id: AgentId,
    reason: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VerificationRequest {
    criterion: String,
    passed: bool,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TaskDetail {
    #[serde(flatten)]
    task: Task,
    verifications: Vec<VerificationResult>,
}

// ---------------------------------------------------------------------------
// Creation & reads
// ---------------------------------------------------------------------------

/// POST /api/tasks -- create a single task.
pub(crate) async fn create_task(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<NewTask>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new) = body?;
    let task = state.tasks.create(new).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// POST /api/tasks/import -- bulk create; existing ids are skipped.
pub(crate) async fn import_tasks(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<Vec<NewTask>>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(tasks) = body?;
    Ok(Json(state.tasks.import(tasks).await?))
}

/// GET /api/tasks -- list by `sprint_id`, `status` and `claimed_by`.
pub(crate) async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<TaskFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.tasks.list(filter).await?))
}

/// GET /api/tasks/{id} -- the task plus its per-criterion verification state.
pub(crate) async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.tasks.get(&id).await?;
    let verifications = state.tasks.verify(&id).await?;
    Ok(Json(TaskDetail {
        task,
        verifications,
    }))
}

// ---------------------------------------------------------------------------
// Ownership transitions
// ---------------------------------------------------------------------------

/// POST /api/tasks/{id}/claim -- capability- and dependency-guarded claim.
///
/// A lost race is `409` with kind `conflict`; a guard failure is `409` with
/// kind `precondition`.
pub(crate) async fn claim_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Result<Json<AgentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    Ok(Json(state.claims.claim(&id, req.agent_id).await?))
}

/// POST /api/tasks/{id}/release
pub(crate) async fn release_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Result<Json<AgentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    Ok(Json(state.tasks.release(&id, req.agent_id).await?))
}

/// POST /api/tasks/{id}/start
pub(crate) async fn start_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Result<Json<AgentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    Ok(Json(state.tasks.mark_in_progress(&id, req.agent_id).await?))
}

/// POST /api/tasks/{id}/progress -- owner-only liveness note.
pub(crate) async fn report_progress(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Result<Json<ProgressRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    let cursor = state
        .tasks
        .report_progress(&id, req.agent_id, &req.note)
        .await?;
    Ok(Json(json!({ "cursor": cursor })))
}

/// POST /api/tasks/{id}/complete -- requires ownership and every criterion
/// passed.
pub(crate) async fn complete_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Result<Json<AgentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    Ok(Json(state.tasks.complete(&id, req.agent_id).await?))
}

/// POST /api/tasks/{id}/block
pub(crate) async fn block_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Result<Json<BlockRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    Ok(Json(
        state.tasks.block(&id, req.agent_id, &req.reason).await?,
    ))
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// GET /api/tasks/{id}/verify
pub(crate) async fn verify_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.tasks.verify(&id).await?))
}

/// POST /api/tasks/{id}/verifications -- record one criterion outcome.
pub(crate) async fn record_verification(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Result<Json<VerificationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    let result = state
        .tasks
        .record_verification(&id, &req.criterion, req.passed, &req.detail)
        .await?;
    Ok(Json(result))
}
