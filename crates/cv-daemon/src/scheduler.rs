use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cv_core::types::{Agent, AgentId, AgentStatus, Task, TaskId};
use tracing::debug;

/// How the scheduler resolved one ready task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice {
    Assign(AgentId),
    /// No active agent has the required capabilities.
    NoCapableAgent,
    /// Capable agents exist but all are busy or already picked this cycle.
    AllBusy,
}

/// Chooses an agent for each ready task.
///
/// Eligibility: effective status `active` and a capability superset of the
/// task's requirements. Among eligible agents the one idle longest wins
/// (`last_assigned_at`, never-assigned first), then the lowest agent ID.
/// Each agent receives at most one task per cycle.
#[derive(Debug, Clone)]
pub struct AssignmentScheduler {
    stale_threshold: Duration,
}

impl AssignmentScheduler {
    pub fn new(stale_threshold: Duration) -> Self {
        Self { stale_threshold }
    }

    /// Eligible agents for `task`, best first.
    pub fn candidates<'a>(
        &self,
        task: &Task,
        agents: &'a [Agent],
        now: DateTime<Utc>,
    ) -> Vec<&'a Agent> {
        let mut eligible: Vec<&Agent> = agents
            .iter()
            .filter(|a| a.effective_status(now, self.stale_threshold) == AgentStatus::Active)
            .filter(|a| a.can_perform(&task.required_capabilities))
            .collect();
        eligible.sort_by(|a, b| {
            a.last_assigned_at
                .cmp(&b.last_assigned_at)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });
        eligible
    }

    /// Assign `ready` tasks (in planning order) to agents not in `busy`.
    pub fn plan(
        &self,
        ready: &[&Task],
        agents: &[Agent],
        busy: &HashSet<AgentId>,
        now: DateTime<Utc>,
    ) -> Vec<(TaskId, Choice)> {
        // Local copy so picks within this cycle count towards fairness.
        let mut pool: Vec<Agent> = agents.to_vec();
        let mut taken: HashSet<AgentId> = busy.clone();
        let mut out = Vec::with_capacity(ready.len());

        for task in ready {
            let candidates = self.candidates(task, &pool, now);
            let choice = if candidates.is_empty() {
                Choice::NoCapableAgent
            } else {
                match candidates.iter().find(|a| !taken.contains(&a.id)) {
                    Some(agent) => Choice::Assign(agent.id),
                    None => Choice::AllBusy,
                }
            };
            if let Choice::Assign(agent_id) = choice {
                taken.insert(agent_id);
                if let Some(agent) = pool.iter_mut().find(|a| a.id == agent_id) {
                    agent.last_assigned_at = Some(now);
                }
                debug!(task_id = %task.id, %agent_id, "agent chosen");
            }
            out.push((task.id.clone(), choice));
        }
        out
    }
}
