use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use cv_core::dlq::DlqFilter;
use uuid::Uuid;

use super::state::ApiState;
use crate::api_error::ApiError;

/// GET /api/dlq -- oldest first, by `status` and `event_type`.
pub(crate) async fn list_entries(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<DlqFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.dlq.list(filter).await?))
}

/// GET /api/dlq/stats
pub(crate) async fn get_stats(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.dlq.stats().await?))
}

/// GET /api/dlq/{id}
pub(crate) async fn get_entry(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.dlq.get(id).await?))
}

/// POST /api/dlq/{id}/retry -- re-apply one entry through the consumer.
pub(crate) async fn retry_entry(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.dlq.retry(id, state.consumer.applier()).await?))
}

/// POST /api/dlq/retry-all -- retry every pending entry matching the query.
pub(crate) async fn retry_all(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<DlqFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .dlq
            .retry_all(filter, state.consumer.applier())
            .await?,
    ))
}
