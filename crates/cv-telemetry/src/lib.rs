//! Observability for convoy processes.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: process-wide counters, gauges and histograms with
//!   Prometheus text export
//! - **Middleware**: axum layers for request metrics and `X-Request-Id`
//!   correlation

pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod tracing_setup;
