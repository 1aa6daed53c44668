use axum::{body::Body, extract::MatchedPath, extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::metrics::{global_metrics, names};

/// Axum middleware that records `api_requests_total{method,route,status}`
/// and `api_request_duration_seconds`.
///
/// The route label is the matched route template (`/api/tasks/{id}/claim`)
/// so task and agent IDs do not explode label cardinality.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    let m = global_metrics();
    m.increment_counter(
        names::API_REQUESTS_TOTAL,
        &[("method", &method), ("route", &route), ("status", &status)],
    );
    m.record_histogram(names::API_REQUEST_DURATION, start.elapsed().as_secs_f64());

    response
}
