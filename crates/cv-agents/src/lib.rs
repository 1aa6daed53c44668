//! Agent-side coordination: identities and liveness, escalations, the
//! capability-guarded claim, event ingestion and the worker loop.

pub mod assignment;
pub mod consumer;
pub mod escalation;
pub mod executor;
pub mod registry;
pub mod worker;
