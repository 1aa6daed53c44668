use chrono::{DateTime, Utc};
use cv_agents::registry::AgentRegistry;
use cv_core::checkpoint::CheckpointManager;
use cv_core::dlq::DeadLetterQueue;
use cv_core::error::Result;
use cv_core::types::{AgentId, TaskId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Result of a single patrol sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolReport {
    /// Agents newly marked stale by this sweep.
    pub stale_agents: Vec<AgentId>,
    /// Tasks released from those agents.
    pub released: Vec<TaskId>,
    /// Pending DLQ entries moved to `abandoned`.
    pub dlq_abandoned: usize,
    pub checkpoints_pruned: usize,
    pub timestamp: DateTime<Utc>,
}

/// Periodic maintenance over the shared store: stale-agent release, DLQ
/// retention and (optionally) checkpoint pruning. Every step is idempotent,
/// so several daemons may patrol the same store.
pub struct PatrolRunner {
    registry: AgentRegistry,
    dlq: DeadLetterQueue,
    checkpoints: CheckpointManager,
    dlq_retention_days: u32,
    checkpoint_retention_days: Option<u32>,
}

impl PatrolRunner {
    pub fn new(
        registry: AgentRegistry,
        dlq: DeadLetterQueue,
        checkpoints: CheckpointManager,
        dlq_retention_days: u32,
    ) -> Self {
        Self {
            registry,
            dlq,
            checkpoints,
            dlq_retention_days,
            checkpoint_retention_days: None,
        }
    }

    /// Also prune checkpoints older than `days`.
    pub fn with_checkpoint_retention(mut self, days: Option<u32>) -> Self {
        self.checkpoint_retention_days = days;
        self
    }

    pub async fn run_patrol(&self) -> Result<PatrolReport> {
        debug!("patrol sweep starting");

        let stale = self.registry.detect_stale().await?;
        let dlq_abandoned = self.dlq.cleanup(self.dlq_retention_days).await?;
        let checkpoints_pruned = match self.checkpoint_retention_days {
            Some(days) => self.checkpoints.prune(days).await?,
            None => 0,
        };

        let report = PatrolReport {
            stale_agents: stale.iter().map(|s| s.agent.id).collect(),
            released: stale.into_iter().flat_map(|s| s.released).collect(),
            dlq_abandoned,
            checkpoints_pruned,
            timestamp: Utc::now(),
        };
        if !report.stale_agents.is_empty() || report.dlq_abandoned > 0 {
            info!(
                stale_agents = report.stale_agents.len(),
                released = report.released.len(),
                dlq_abandoned = report.dlq_abandoned,
                checkpoints_pruned = report.checkpoints_pruned,
                "patrol found work"
            );
        }
        Ok(report)
    }
}
