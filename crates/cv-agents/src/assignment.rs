//! Capability-guarded claims.
//!
//! The task store has no notion of capabilities or dependencies; those
//! checks live here, in front of the store's compare-and-set. Every claim
//! made on behalf of an orchestrator, a worker or the HTTP API goes through
//! [`GuardedClaim`].

use cv_core::error::{Precondition, Result};
use cv_core::task_store::TaskStore;
use cv_core::types::{AgentId, AgentStatus, Task};
use cv_telemetry::metrics::{global_metrics, names};
use tracing::debug;

use crate::registry::AgentRegistry;

#[derive(Clone)]
pub struct GuardedClaim {
    registry: AgentRegistry,
    tasks: TaskStore,
}

impl GuardedClaim {
    pub fn new(registry: AgentRegistry, tasks: TaskStore) -> Self {
        Self { registry, tasks }
    }

    /// Claim `task_id` for `agent_id` after checking, in order: the agent
    /// exists and is active, it has every required capability, and every
    /// dependency is complete. A lost race still surfaces as `Conflict`.
    pub async fn claim(&self, task_id: &str, agent_id: AgentId) -> Result<Task> {
        let result = self.try_claim(task_id, agent_id).await;
        let outcome = match &result {
            Ok(_) => "won",
            Err(e) if e.is_conflict() => "conflict",
            Err(e) => e.kind().as_str(),
        };
        global_metrics().increment_counter(names::CLAIMS_TOTAL, &[("outcome", outcome)]);
        result
    }

    async fn try_claim(&self, task_id: &str, agent_id: AgentId) -> Result<Task> {
        let agent = self.registry.get(agent_id).await?;
        if agent.status != AgentStatus::Active {
            return Err(Precondition::AgentNotActive(agent_id.to_string()).into());
        }

        let task = self.tasks.get(task_id).await?;
        let missing = agent.missing_capabilities(&task.required_capabilities);
        if !missing.is_empty() {
            debug!(task_id, %agent_id, ?missing, "claim refused on capabilities");
            return Err(Precondition::CapabilityMismatch {
                task_id: task.id,
                agent_id: agent_id.to_string(),
                missing,
            }
            .into());
        }

        let pending = self.tasks.pending_dependencies(&task).await?;
        if !pending.is_empty() {
            return Err(Precondition::DependenciesIncomplete {
                task_id: task.id,
                pending,
            }
            .into());
        }

        self.tasks.claim(task_id, agent_id).await
    }
}
