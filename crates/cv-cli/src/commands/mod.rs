pub mod agent;
pub mod checkpoint;
pub mod dlq;
pub mod escalation;
pub mod notifications;
pub mod orchestrate;
pub mod task;
pub mod verify;

use std::sync::Arc;

use anyhow::Context;
use cv_agents::escalation::EscalationManager;
use cv_agents::registry::AgentRegistry;
use cv_core::checkpoint::CheckpointManager;
use cv_core::config::Config;
use cv_core::db::CoordDb;
use cv_core::dlq::DeadLetterQueue;
use cv_core::event_log::EventLog;
use cv_core::task_store::TaskStore;
use serde::Serialize;

/// Everything a command needs: the loaded config and a handle on the
/// shared store. Commands coordinate with other processes only through it.
pub struct Ctx {
    pub config: Config,
    pub db: Arc<CoordDb>,
    pub json: bool,
}

impl Ctx {
    pub async fn open(config: Config, json: bool) -> anyhow::Result<Self> {
        let path = config.store.resolved_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db = CoordDb::open(&path, config.general.project_id.clone())
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?
            .with_call_timeout(config.store.call_timeout());
        Ok(Self {
            config,
            db: Arc::new(db),
            json,
        })
    }

    pub fn tasks(&self) -> TaskStore {
        TaskStore::new(Arc::clone(&self.db))
    }

    pub fn registry(&self) -> AgentRegistry {
        AgentRegistry::new(Arc::clone(&self.db), self.config.orchestrator.stale_threshold())
    }

    pub fn escalations(&self) -> EscalationManager {
        EscalationManager::new(Arc::clone(&self.db))
    }

    pub fn checkpoints(&self) -> CheckpointManager {
        CheckpointManager::new(Arc::clone(&self.db))
    }

    pub fn dlq(&self) -> DeadLetterQueue {
        DeadLetterQueue::from_config(Arc::clone(&self.db), &self.config.dlq)
    }

    pub fn events(&self) -> EventLog {
        EventLog::new(Arc::clone(&self.db))
    }

    /// Print `value` as JSON under `--json`, otherwise the human text.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            let text = human();
            if !text.is_empty() {
                println!("{text}");
            }
        }
        Ok(())
    }
}

/// Short form of a UUID for tables.
pub fn short(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

#[cfg(test)]
pub(crate) async fn test_ctx() -> Ctx {
    let mut config = Config::default();
    config.general.project_id = "test".into();
    Ctx {
        db: Arc::new(CoordDb::open_in_memory("test").await.unwrap()),
        config,
        json: false,
    }
}
