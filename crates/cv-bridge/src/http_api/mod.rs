// ---------------------------------------------------------------------------
// HTTP API module directory
// ---------------------------------------------------------------------------
//
// One sub-module per resource. This file owns the Axum router and its
// middleware stack.

mod agents;
mod checkpoints;
mod dlq;
mod escalations;
mod events;
mod misc;
mod notifications;
pub mod state;
mod tasks;

pub use self::router::api_router;
pub use state::ApiState;

// ---------------------------------------------------------------------------
// Router + middleware
// ---------------------------------------------------------------------------

mod router {
    use super::*;
    use axum::{
        middleware as axum_middleware,
        routing::{get, post},
        Router,
    };
    use std::sync::Arc;
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    use cv_telemetry::middleware::metrics_middleware;
    use cv_telemetry::tracing_setup::request_id_middleware;

    /// Build the full REST router.
    ///
    /// Cross-origin requests are only allowed from loopback origins; the API
    /// is meant for local tooling.
    pub fn api_router(state: Arc<ApiState>) -> Router {
        Router::new()
            .route("/api/status", get(misc::get_status))
            .route("/api/metrics", get(misc::get_metrics_prometheus))
            // agents
            .route(
                "/api/agents",
                get(agents::list_agents).post(agents::register_agent),
            )
            .route(
                "/api/agents/{id}",
                get(agents::get_agent)
                    .patch(agents::heartbeat_agent)
                    .delete(agents::deregister_agent),
            )
            // tasks
            .route(
                "/api/tasks",
                get(tasks::list_tasks).post(tasks::create_task),
            )
            .route("/api/tasks/import", post(tasks::import_tasks))
            .route("/api/tasks/{id}", get(tasks::get_task))
            .route("/api/tasks/{id}/claim", post(tasks::claim_task))
            .route("/api/tasks/{id}/release", post(tasks::release_task))
            .route("/api/tasks/{id}/start", post(tasks::start_task))
            .route("/api/tasks/{id}/progress", post(tasks::report_progress))
            .route("/api/tasks/{id}/complete", post(tasks::complete_task))
            .route("/api/tasks/{id}/block", post(tasks::block_task))
            .route("/api/tasks/{id}/verify", get(tasks::verify_task))
            .route(
                "/api/tasks/{id}/verifications",
                post(tasks::record_verification),
            )
            // checkpoints
            .route(
                "/api/checkpoints",
                get(checkpoints::list_checkpoints).post(checkpoints::create_checkpoint),
            )
            .route("/api/checkpoints/{id}", get(checkpoints::get_checkpoint))
            // escalations
            .route(
                "/api/escalations",
                get(escalations::list_escalations).post(escalations::create_escalation),
            )
            .route("/api/escalations/{id}", get(escalations::get_escalation))
            .route(
                "/api/escalations/{id}/resolve",
                post(escalations::resolve_escalation),
            )
            // dead-letter queue
            .route("/api/dlq", get(dlq::list_entries))
            .route("/api/dlq/stats", get(dlq::get_stats))
            .route("/api/dlq/retry-all", post(dlq::retry_all))
            .route("/api/dlq/{id}", get(dlq::get_entry))
            .route("/api/dlq/{id}/retry", post(dlq::retry_entry))
            // notifications
            .route("/api/notifications/hooks", get(notifications::list_hooks))
            .route(
                "/api/notifications/hooks/{id}/test",
                post(notifications::test_hook),
            )
            .route(
                "/api/notifications/history",
                get(notifications::get_history),
            )
            // event log
            .route(
                "/api/events",
                get(events::list_events).post(events::ingest_event),
            )
            .layer(axum_middleware::from_fn(metrics_middleware))
            .layer(axum_middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(tower_http::cors::AllowOrigin::predicate(
                        |origin: &axum::http::HeaderValue, _parts: &axum::http::request::Parts| {
                            origin.to_str().is_ok_and(|o| {
                                o.starts_with("http://localhost")
                                    || o.starts_with("http://127.0.0.1")
                            })
                        },
                    ))
                    .allow_methods([
                        axum::http::Method::GET,
                        axum::http::Method::POST,
                        axum::http::Method::PATCH,
                        axum::http::Method::DELETE,
                    ])
                    .allow_headers([axum::http::header::CONTENT_TYPE]),
            )
            .with_state(state)
    }
}
