//! Event ingestion.
//!
//! External reporters submit [`RawEvent`]s. The consumer parses each one
//! into a typed [`Event`] and applies it through the owning component, which
//! appends the canonical event to the log. Anything that fails, from an
//! unknown type to a claim on a missing task, is captured in the dead-letter
//! queue and reported back instead of propagating.

use std::sync::Arc;

use async_trait::async_trait;
use cv_core::dlq::{DeadLetterQueue, EventApplier};
use cv_core::error::{Precondition, Result};
use cv_core::events::{Event, RawEvent};
use cv_core::task_store::TaskStore;
use cv_telemetry::metrics::{global_metrics, names};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::assignment::GuardedClaim;
use crate::escalation::EscalationManager;
use crate::registry::AgentRegistry;

// ---------------------------------------------------------------------------
// StoreApplier
// ---------------------------------------------------------------------------

/// Applies typed events to the task store, agent registry and escalation
/// manager. Derived or observational kinds are `NotApplicable`.
#[derive(Clone)]
pub struct StoreApplier {
    tasks: TaskStore,
    registry: AgentRegistry,
    escalations: EscalationManager,
    claims: GuardedClaim,
}

impl StoreApplier {
    pub fn new(tasks: TaskStore, registry: AgentRegistry, escalations: EscalationManager) -> Self {
        let claims = GuardedClaim::new(registry.clone(), tasks.clone());
        Self {
            tasks,
            registry,
            escalations,
            claims,
        }
    }

    pub async fn apply_event(&self, event: Event) -> Result<()> {
        match event {
            Event::AgentRegistered {
                agent_id,
                name,
                capabilities,
            } => {
                self.registry
                    .register_with_id(agent_id, &name, capabilities)
                    .await?;
            }
            Event::AgentHeartbeat { agent_id, status } => {
                self.registry.heartbeat(agent_id, status).await?;
            }
            Event::AgentDeregistered { agent_id, .. } => {
                self.registry.deregister(agent_id).await?;
            }
            Event::TaskCreated { task } => {
                self.tasks.create(task).await?;
            }
            Event::TaskOffered { task_id, agent_id } => {
                self.tasks.get(&task_id).await?;
                self.registry.record_offer(&task_id, agent_id).await?;
            }
            Event::TaskClaimed { task_id, agent_id } => {
                self.claims.claim(&task_id, agent_id).await?;
            }
            Event::TaskReleased {
                task_id, agent_id, ..
            } => {
                self.tasks.release(&task_id, agent_id).await?;
            }
            Event::TaskStarted { task_id, agent_id } => {
                self.tasks.mark_in_progress(&task_id, agent_id).await?;
            }
            Event::TaskProgress {
                task_id,
                agent_id,
                note,
            } => {
                self.tasks.report_progress(&task_id, agent_id, &note).await?;
            }
            Event::TaskVerified {
                task_id,
                criterion,
                passed,
                detail,
            } => {
                self.tasks
                    .record_verification(&task_id, &criterion, passed, &detail)
                    .await?;
            }
            Event::TaskCompleted { task_id, agent_id } => {
                self.tasks.complete(&task_id, agent_id).await?;
            }
            Event::TaskBlocked {
                task_id,
                agent_id,
                reason,
            } => {
                self.tasks.block(&task_id, agent_id, &reason).await?;
            }
            Event::EscalationCreated {
                escalation_id,
                task_id,
                severity,
                reason,
            } => {
                self.escalations
                    .create_with_id(escalation_id, &task_id, &reason, severity)
                    .await?;
            }
            Event::EscalationResolved {
                escalation_id,
                resolution,
                ..
            } => {
                self.escalations.resolve(escalation_id, &resolution).await?;
            }
            other @ (Event::AgentStale { .. }
            | Event::CheckpointCreated { .. }
            | Event::EscalationCritical { .. }
            | Event::SprintCompleted { .. }
            | Event::SprintStalled { .. }
            | Event::NotificationTest { .. }) => {
                return Err(Precondition::NotApplicable(other.event_type().to_string()).into());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventApplier for StoreApplier {
    async fn apply(&self, event: &RawEvent) -> Result<()> {
        let event = event.parse()?;
        self.apply_event(event).await
    }
}

// ---------------------------------------------------------------------------
// EventConsumer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Applied,
    DeadLettered { entry_id: Uuid, reason: String },
}

/// Front door for externally reported events.
#[derive(Clone)]
pub struct EventConsumer {
    applier: Arc<dyn EventApplier>,
    dlq: DeadLetterQueue,
}

impl EventConsumer {
    pub fn new(applier: Arc<dyn EventApplier>, dlq: DeadLetterQueue) -> Self {
        Self { applier, dlq }
    }

    pub fn applier(&self) -> &dyn EventApplier {
        self.applier.as_ref()
    }

    /// Apply `raw`, or capture it in the DLQ. Only a failure to record the
    /// DLQ entry itself is returned as an error.
    pub async fn ingest(&self, raw: RawEvent) -> Result<IngestOutcome> {
        match self.applier.apply(&raw).await {
            Ok(()) => {
                debug!(event_type = %raw.event_type, "event applied");
                global_metrics()
                    .increment_counter(names::EVENTS_INGESTED_TOTAL, &[("outcome", "applied")]);
                Ok(IngestOutcome::Applied)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(event_type = %raw.event_type, error = %reason, "event application failed");
                let entry = self.dlq.capture(raw, reason.clone()).await?;
                global_metrics().increment_counter(
                    names::EVENTS_INGESTED_TOTAL,
                    &[("outcome", "dead_lettered")],
                );
                global_metrics().increment_counter(
                    names::DLQ_CAPTURED_TOTAL,
                    &[("event_type", entry.original_event.event_type.as_str())],
                );
                Ok(IngestOutcome::DeadLettered {
                    entry_id: entry.id,
                    reason,
                })
            }
        }
    }
}
