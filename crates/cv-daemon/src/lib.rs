//! Supervising processes of the convoy coordination core.
//!
//! - [`orchestrator`]: the per-epic planning, assignment and monitoring run
//! - [`scheduler`]: capability-and-fairness agent selection
//! - [`patrol`]: stale-agent sweep plus DLQ and checkpoint retention
//! - [`tailer`]: event log follower feeding the in-process bus
//! - [`daemon`]: HTTP API server and background loops

pub mod daemon;
pub mod orchestrator;
pub mod patrol;
pub mod scheduler;
pub mod tailer;
