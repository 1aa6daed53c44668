use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use cv_core::checkpoint::CheckpointFilter;
use cv_core::types::NewCheckpoint;
use uuid::Uuid;

use super::state::ApiState;
use crate::api_error::ApiError;

/// POST /api/checkpoints -- snapshot the current log head.
pub(crate) async fn create_checkpoint(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<NewCheckpoint>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new) = body?;
    let checkpoint = state.checkpoints.create(new).await?;
    Ok((StatusCode::CREATED, Json(checkpoint)))
}

/// GET /api/checkpoints -- newest first, by `task_id`, `sprint_id`, or
/// `orchestrator_only`.
pub(crate) async fn list_checkpoints(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<CheckpointFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.checkpoints.list(filter).await?))
}

/// GET /api/checkpoints/{id}
pub(crate) async fn get_checkpoint(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.checkpoints.get(id).await?))
}
