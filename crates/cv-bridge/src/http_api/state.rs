use std::sync::Arc;

use chrono::{DateTime, Utc};
use cv_agents::assignment::GuardedClaim;
use cv_agents::consumer::{EventConsumer, StoreApplier};
use cv_agents::escalation::EscalationManager;
use cv_agents::registry::AgentRegistry;
use cv_core::checkpoint::CheckpointManager;
use cv_core::config::Config;
use cv_core::db::CoordDb;
use cv_core::dlq::DeadLetterQueue;
use cv_core::event_log::EventLog;
use cv_core::task_store::TaskStore;

use crate::notifications::NotificationDispatcher;

/// Shared state for every HTTP handler. All components are cheap handles
/// over one [`CoordDb`].
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<CoordDb>,
    pub tasks: TaskStore,
    pub registry: AgentRegistry,
    pub claims: GuardedClaim,
    pub escalations: EscalationManager,
    pub checkpoints: CheckpointManager,
    pub dlq: DeadLetterQueue,
    pub events: EventLog,
    pub consumer: EventConsumer,
    pub notifications: Arc<NotificationDispatcher>,
    pub started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(
        db: Arc<CoordDb>,
        config: &Config,
        notifications: Arc<NotificationDispatcher>,
    ) -> Self {
        let tasks = TaskStore::new(Arc::clone(&db));
        let registry = AgentRegistry::new(Arc::clone(&db), config.orchestrator.stale_threshold());
        let escalations = EscalationManager::new(Arc::clone(&db));
        let dlq = DeadLetterQueue::from_config(Arc::clone(&db), &config.dlq);
        let applier = StoreApplier::new(tasks.clone(), registry.clone(), escalations.clone());
        Self {
            claims: GuardedClaim::new(registry.clone(), tasks.clone()),
            checkpoints: CheckpointManager::new(Arc::clone(&db)),
            events: EventLog::new(Arc::clone(&db)),
            consumer: EventConsumer::new(Arc::new(applier), dlq.clone()),
            tasks,
            registry,
            escalations,
            dlq,
            notifications,
            started_at: Utc::now(),
            db,
        }
    }
}
