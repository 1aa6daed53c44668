use axum::{body::Body, extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// 32 hex characters, usable as a trace ID.
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Axum middleware that propagates or assigns `X-Request-Id` and runs the
/// request inside an `http_request` span carrying it.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_trace_id);

    let header = HeaderValue::from_str(&request_id)
        .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
    request.headers_mut().insert(REQUEST_ID_HEADER, header.clone());

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = next.run(request).instrument(span).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, header);
    response
}

/// A named span for a long-running operation (an orchestrator run, a worker
/// session), returned with its trace ID for log correlation.
pub fn operation_span(operation: &str) -> (tracing::Span, String) {
    let trace_id = generate_trace_id();
    let span = tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        operation = %operation,
    );
    (span, trace_id)
}
