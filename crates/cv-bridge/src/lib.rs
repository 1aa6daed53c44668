//! External surfaces of the coordination core.
//!
//! - [`http_api`]: axum REST API over agents, tasks, checkpoints,
//!   escalations, the DLQ, notifications and the event log
//! - [`api_error`]: mapping of the error taxonomy onto HTTP statuses
//! - [`event_bus`]: in-process fan-out of event log records
//! - [`notifications`]: best-effort webhook dispatch with delivery history

pub mod api_error;
pub mod event_bus;
pub mod http_api;
pub mod notifications;
