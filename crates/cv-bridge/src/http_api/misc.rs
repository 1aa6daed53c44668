use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use cv_agents::registry::AgentFilter;
use cv_core::dlq::DlqStats;
use cv_core::task_store::TaskFilter;
use cv_core::types::{AgentStatus, TaskStatus};
use cv_telemetry::metrics::{global_metrics, names};
use serde::Serialize;

use super::state::ApiState;
use crate::api_error::ApiError;

#[derive(Debug, Serialize)]
pub(crate) struct StatusResponse {
    project_id: String,
    version: &'static str,
    started_at: DateTime<Utc>,
    uptime_seconds: i64,
    event_head: u64,
    agents_active: usize,
    tasks_incomplete: usize,
    escalations_open: usize,
    dlq: DlqStats,
}

/// GET /api/status -- a one-shot summary of the coordination state.
pub(crate) async fn get_status(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let event_head = state.events.head().await?;
    let agents_active = state
        .registry
        .list(AgentFilter {
            status: Some(AgentStatus::Active),
            capability: None,
        })
        .await?
        .len();
    let tasks_incomplete = state
        .tasks
        .list(TaskFilter::default())
        .await?
        .iter()
        .filter(|t| t.status != TaskStatus::Complete)
        .count();
    let escalations_open = state
        .escalations
        .list(cv_agents::escalation::EscalationFilter::open())
        .await?
        .len();
    let dlq = state.dlq.stats().await?;

    global_metrics().set_gauge(names::AGENTS_ACTIVE, &[], agents_active as i64);
    global_metrics().set_gauge(names::TASKS_INCOMPLETE, &[], tasks_incomplete as i64);

    Ok(Json(StatusResponse {
        project_id: state.db.project_id().to_string(),
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        event_head,
        agents_active,
        tasks_incomplete,
        escalations_open,
        dlq,
    }))
}

/// GET /api/metrics -- exports telemetry metrics in Prometheus text format.
pub(crate) async fn get_metrics_prometheus() -> impl IntoResponse {
    let body = global_metrics().export_prometheus();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}
