use axum::{body::Body, http::Request, middleware, routing::get, Router};
use cv_telemetry::logging::{self, LogFormat};
use cv_telemetry::metrics::{global_metrics, names, MetricsCollector};
use cv_telemetry::middleware::metrics_middleware;
use cv_telemetry::tracing_setup::{request_id_middleware, REQUEST_ID_HEADER};
use tower::ServiceExt;

fn app() -> Router {
    Router::new()
        .route("/api/tasks/{id}", get(|| async { "ok" }))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}

#[test]
fn init_logging_is_idempotent() {
    logging::init("test-service", LogFormat::Human, "debug");
    logging::init("test-service", LogFormat::Json, "info");
    tracing::info!(key = "value", "log line");
}

#[test]
fn log_format_parse() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
    assert_eq!(LogFormat::parse("human"), LogFormat::Human);
    assert_eq!(LogFormat::parse("anything"), LogFormat::Human);
}

#[test]
fn prometheus_export_groups_families() {
    let m = MetricsCollector::new();
    m.increment_counter(names::CLAIMS_TOTAL, &[("outcome", "won")]);
    m.increment_counter(names::CLAIMS_TOTAL, &[("outcome", "conflict")]);
    m.set_gauge(names::AGENTS_ACTIVE, &[], 3);

    let out = m.export_prometheus();
    assert_eq!(out.matches("# TYPE claims_total counter").count(), 1);
    assert!(out.contains("claims_total{outcome=\"won\"} 1"));
    assert!(out.contains("# TYPE agents_active gauge"));
    assert!(out.contains("agents_active 3"));
}

#[tokio::test]
async fn request_id_is_generated_and_echoed() {
    let response = app()
        .oneshot(Request::get("/api/tasks/T1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let id = response.headers().get(REQUEST_ID_HEADER).unwrap();
    assert_eq!(id.len(), 32);

    let response = app()
        .oneshot(
            Request::get("/api/tasks/T1")
                .header(REQUEST_ID_HEADER, "abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "abc-123");
}

#[tokio::test]
async fn metrics_use_route_templates() {
    app()
        .oneshot(Request::get("/api/tasks/T42").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let count = global_metrics().get_counter(
        names::API_REQUESTS_TOTAL,
        &[("method", "GET"), ("route", "/api/tasks/{id}"), ("status", "200")],
    );
    assert!(count >= 1);
}
