//! Runtime plumbing shared by the convoy control loops.
//!
//! - Bounded retry with exponential backoff, used by DLQ retry and
//!   notification delivery
//! - Cooperative stop coordination for daemons, workers and the orchestrator

pub mod retry;
pub mod shutdown;
