use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use cv_agents::escalation::EscalationFilter;
use cv_core::types::{Severity, TaskId};
use serde::Deserialize;
use uuid::Uuid;

use super::state::ApiState;
use crate::api_error::ApiError;

#[derive(Debug, Deserialize)]
pub(crate) struct CreateEscalationRequest {
    task_id: TaskId,
    reason: String,
    severity: Severity,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResolveRequest {
    resolution: String,
}

/// POST /api/escalations -- raise a request for human input on a task.
pub(crate) async fn create_escalation(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<CreateEscalationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    let escalation = state
        .escalations
        .create(&req.task_id, &req.reason, req.severity)
        .await?;
    Ok((StatusCode::CREATED, Json(escalation)))
}

/// GET /api/escalations -- newest first, by `status`, `severity`, `task_id`.
pub(crate) async fn list_escalations(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<EscalationFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.escalations.list(filter).await?))
}

/// GET /api/escalations/{id}
pub(crate) async fn get_escalation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.escalations.get(id).await?))
}

/// POST /api/escalations/{id}/resolve -- terminal; a second resolve is `409`.
pub(crate) async fn resolve_escalation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    body: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    Ok(Json(state.escalations.resolve(id, &req.resolution).await?))
}
