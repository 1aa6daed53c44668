use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use super::state::ApiState;
use crate::api_error::ApiError;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HistoryQuery {
    #[serde(default)]
    limit: Option<usize>,
}

/// GET /api/notifications/hooks -- the configured hooks.
pub(crate) async fn list_hooks(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.notifications.hooks().to_vec())
}

/// POST /api/notifications/hooks/{id}/test -- deliver a synthetic event and
/// report the final attempt. A failed delivery is still a `200`.
pub(crate) async fn test_hook(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.notifications.test(&id).await?))
}

/// GET /api/notifications/history -- recent delivery attempts, newest first.
pub(crate) async fn get_history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(50);
    Ok(Json(state.notifications.history(limit).await?))
}
