use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use cv_agents::consumer::IngestOutcome;
use cv_core::events::{EventRecord, RawEvent};
use serde::{Deserialize, Serialize};

use super::state::ApiState;
use crate::api_error::ApiError;

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct EventsQuery {
    #[serde(default)]
    after: u64,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub(crate) struct EventsPage {
    head: u64,
    events: Vec<EventRecord>,
}

/// GET /api/events -- page through the log after cursor `after`.
pub(crate) async fn list_events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let head = state.events.head().await?;
    let events = state.events.read_from(query.after, limit).await?;
    Ok(Json(EventsPage { head, events }))
}

/// POST /api/events -- ingest an externally reported event.
///
/// `200` when applied; `202` with the dead-letter entry id when it could not
/// be applied and was captured for retry.
pub(crate) async fn ingest_event(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<RawEvent>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(raw) = body?;
    let outcome = state.consumer.ingest(raw).await?;
    let status = match outcome {
        IngestOutcome::Applied => StatusCode::OK,
        IngestOutcome::DeadLettered { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}
