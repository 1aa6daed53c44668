use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use cv_agents::registry::AgentFilter;
use cv_core::types::{AgentId, AgentStatus};
use serde::Deserialize;
use serde_json::json;

use super::state::ApiState;
use crate::api_error::ApiError;

#[derive(Debug, Deserialize)]
pub(crate) struct RegisterAgentRequest {
    name: String,
    #[serde(default)]
    capabilities: BTreeSet<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HeartbeatRequest {
    #[serde(default)]
    status: Option<AgentStatus>,
}

/// POST /api/agents -- register an agent and issue its id.
///
/// A name held by a stale agent is taken over; a name held by a live agent
/// is a `409`.
pub(crate) async fn register_agent(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<RegisterAgentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    let agent = state.registry.register(&req.name, req.capabilities).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

/// GET /api/agents -- list agents, optionally by `status` and `capability`.
pub(crate) async fn list_agents(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<AgentFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.list(filter).await?))
}

/// GET /api/agents/{id}
pub(crate) async fn get_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<AgentId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.get(id).await?))
}

/// PATCH /api/agents/{id} -- heartbeat, optionally changing `active`/`idle`.
pub(crate) async fn heartbeat_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<AgentId>,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    Ok(Json(state.registry.heartbeat(id, req.status).await?))
}

/// DELETE /api/agents/{id} -- deregister and release every claimed or
/// in-progress task the agent held.
pub(crate) async fn deregister_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<AgentId>,
) -> Result<impl IntoResponse, ApiError> {
    let released = state.registry.deregister(id).await?;
    Ok(Json(json!({ "agent_id": id, "released": released })))
}
