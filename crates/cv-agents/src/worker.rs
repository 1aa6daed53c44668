//! The worker agent loop.
//!
//! A worker registers, then repeatedly picks up one task at a time: an offer
//! addressed to it in the event log (supervised mode) or the first ready task
//! it is capable of (peer-swarm mode). While a task executes, the worker keeps
//! heartbeating and appends `task.progress` so the orchestrator sees motion.
//! On shutdown an in-flight task is released and the agent deregisters.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cv_core::error::{CoordError, ErrorKind, Precondition, Result};
use cv_core::event_log::EventLog;
use cv_core::events::Event;
use cv_core::graph;
use cv_core::task_store::{TaskFilter, TaskStore};
use cv_core::types::{Agent, AgentId, EscalationStatus, Severity, Task, TaskId, TaskStatus};
use cv_harness::shutdown::{ShutdownSignal, StopListener};
use cv_telemetry::metrics::{global_metrics, names};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::assignment::GuardedClaim;
use crate::escalation::{EscalationFilter, EscalationManager};
use crate::executor::{ExecutionOutcome, TaskExecutor};
use crate::registry::AgentRegistry;

/// Events read from the log per offer scan.
const OFFER_SCAN_BATCH: usize = 500;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Wait for `task.offered` events addressed to this agent.
    Supervised,
    /// Claim ready tasks directly; the store's compare-and-set arbitrates.
    PeerSwarm,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub mode: WorkerMode,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Restrict peer-swarm self-service to one epic.
    pub sprint_id: Option<String>,
    /// Exit after this many consecutive polls without work.
    pub max_idle_polls: Option<u32>,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, capabilities: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
            mode: WorkerMode::Supervised,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            sprint_id: None,
            max_idle_polls: None,
        }
    }
}

/// What a worker run accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub agent_id: Option<AgentId>,
    pub completed: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
    pub released: Vec<TaskId>,
}

enum TaskEnd {
    Completed,
    Blocked,
    Released,
    /// Ownership was lost mid-run (stale release, replaced identity).
    Lost,
    /// Shutdown arrived mid-run; the task was handed back.
    Interrupted,
}

// ---------------------------------------------------------------------------
// WorkerAgent
// ---------------------------------------------------------------------------

pub struct WorkerAgent {
    config: WorkerConfig,
    registry: AgentRegistry,
    tasks: TaskStore,
    claims: GuardedClaim,
    escalations: EscalationManager,
    events: EventLog,
    executor: Arc<dyn TaskExecutor>,
    shutdown: ShutdownSignal,
}

struct RunState {
    agent: Agent,
    cursor: u64,
    /// Offers not yet tried, oldest first.
    offers: VecDeque<TaskId>,
    last_heartbeat: Instant,
    report: WorkerReport,
}

impl WorkerAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        registry: AgentRegistry,
        tasks: TaskStore,
        escalations: EscalationManager,
        events: EventLog,
        executor: Arc<dyn TaskExecutor>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let claims = GuardedClaim::new(registry.clone(), tasks.clone());
        Self {
            config,
            registry,
            tasks,
            claims,
            escalations,
            events,
            executor,
            shutdown,
        }
    }

    /// Run until shutdown, the idle limit, or a fatal store error.
    pub async fn run(self) -> Result<WorkerReport> {
        let cursor = self.events.head().await?;
        let agent = self
            .registry
            .register(&self.config.name, self.config.capabilities.clone())
            .await?;
        info!(
            agent_id = %agent.id,
            name = %agent.name,
            mode = ?self.config.mode,
            "worker started"
        );

        let mut state = RunState {
            report: WorkerReport {
                agent_id: Some(agent.id),
                ..WorkerReport::default()
            },
            agent,
            cursor,
            offers: VecDeque::new(),
            last_heartbeat: Instant::now(),
        };

        let result = self.work_loop(&mut state).await;

        match self.registry.deregister(state.agent.id).await {
            Ok(released) => state.report.released.extend(released),
            Err(CoordError::NotFound { .. }) => {}
            Err(e) => warn!(agent_id = %state.agent.id, error = %e, "deregister failed"),
        }
        info!(
            agent_id = %state.agent.id,
            completed = state.report.completed.len(),
            blocked = state.report.blocked.len(),
            "worker stopped"
        );
        result.map(|()| state.report)
    }

    async fn work_loop(&self, state: &mut RunState) -> Result<()> {
        let mut stop = self.shutdown.subscribe();
        let mut idle_polls = 0u32;

        loop {
            if self.shutdown.is_shutting_down() {
                return Ok(());
            }
            if state.last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                self.heartbeat(state).await?;
            }

            match self.next_task(state).await {
                Ok(Some(task)) => {
                    idle_polls = 0;
                    match self.run_task(state, task, &mut stop).await? {
                        TaskEnd::Interrupted => return Ok(()),
                        _ => continue,
                    }
                }
                Ok(None) => {}
                Err(e) if e.kind() == ErrorKind::Transient => {
                    warn!(agent_id = %state.agent.id, error = %e, "store unavailable, retrying next poll");
                }
                Err(e) => return Err(e),
            }

            idle_polls += 1;
            if self
                .config
                .max_idle_polls
                .is_some_and(|limit| idle_polls >= limit)
            {
                info!(agent_id = %state.agent.id, idle_polls, "no work left, exiting");
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = stop.stopped() => return Ok(()),
            }
        }
    }

    async fn heartbeat(&self, state: &mut RunState) -> Result<()> {
        state.agent = self.registry.heartbeat(state.agent.id, None).await?;
        state.last_heartbeat = Instant::now();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finding work
    // -----------------------------------------------------------------------

    /// Claim the next task this worker should run, if any.
    async fn next_task(&self, state: &mut RunState) -> Result<Option<Task>> {
        if let Some(task) = self.resumable(state).await? {
            return Ok(Some(task));
        }

        match self.config.mode {
            WorkerMode::Supervised => {
                self.scan_offers(state).await?;
                while let Some(task_id) = state.offers.pop_front() {
                    if let Some(task) = self.try_claim(state, &task_id).await? {
                        return Ok(Some(task));
                    }
                }
            }
            WorkerMode::PeerSwarm => {
                for task_id in self.ready_tasks(state).await? {
                    if let Some(task) = self.try_claim(state, &task_id).await? {
                        return Ok(Some(task));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Claim `task_id`, treating a lost race or a failed guard as "not this
    /// one".
    async fn try_claim(&self, state: &RunState, task_id: &str) -> Result<Option<Task>> {
        match self.claims.claim(task_id, state.agent.id).await {
            Ok(task) => Ok(Some(task)),
            Err(e) if matches!(
                e.kind(),
                ErrorKind::Conflict | ErrorKind::Precondition | ErrorKind::NotFound
            ) =>
            {
                debug!(%task_id, agent_id = %state.agent.id, reason = %e, "skipping candidate");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// A task already owned by this worker that it should run now: one
    /// claimed on its behalf, or one it blocked earlier whose escalations are
    /// all resolved.
    async fn resumable(&self, state: &RunState) -> Result<Option<Task>> {
        let owned = self
            .tasks
            .list(TaskFilter {
                claimed_by: Some(state.agent.id),
                ..TaskFilter::default()
            })
            .await?;
        if let Some(task) = owned.iter().find(|t| t.status == TaskStatus::Claimed) {
            debug!(task_id = %task.id, "picking up task claimed on our behalf");
            return Ok(Some(task.clone()));
        }
        for task in owned.into_iter().filter(|t| t.status == TaskStatus::Blocked) {
            let escalations = self
                .escalations
                .list(EscalationFilter {
                    task_id: Some(task.id.clone()),
                    ..EscalationFilter::default()
                })
                .await?;
            let open = escalations
                .iter()
                .any(|e| e.status == EscalationStatus::Open);
            if !escalations.is_empty() && !open {
                info!(task_id = %task.id, "escalation resolved, resuming task");
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn scan_offers(&self, state: &mut RunState) -> Result<()> {
        loop {
            let records = self.events.read_from(state.cursor, OFFER_SCAN_BATCH).await?;
            let Some(last) = records.last() else {
                return Ok(());
            };
            state.cursor = last.cursor;
            let full = records.len() == OFFER_SCAN_BATCH;
            for record in records {
                if let Event::TaskOffered { task_id, agent_id } = record.event {
                    if agent_id == state.agent.id && !state.offers.contains(&task_id) {
                        debug!(%task_id, cursor = record.cursor, "offer received");
                        state.offers.push_back(task_id);
                    }
                }
            }
            if !full {
                return Ok(());
            }
        }
    }

    /// Ready `todo` tasks this agent can perform, in creation order.
    async fn ready_tasks(&self, state: &RunState) -> Result<Vec<TaskId>> {
        let todo = self
            .tasks
            .list(TaskFilter {
                sprint_id: self.config.sprint_id.clone(),
                status: Some(TaskStatus::Todo),
                claimed_by: None,
            })
            .await?;
        let deps: Vec<TaskId> = todo
            .iter()
            .flat_map(|t| t.dependencies.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let statuses = self.tasks.statuses(deps).await?;
        Ok(todo
            .into_iter()
            .filter(|t| state.agent.can_perform(&t.required_capabilities))
            .filter(|t| graph::is_ready(t, &statuses))
            .map(|t| t.id)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Running a task
    // -----------------------------------------------------------------------

    async fn run_task(
        &self,
        state: &mut RunState,
        task: Task,
        stop: &mut StopListener,
    ) -> Result<TaskEnd> {
        let agent_id = state.agent.id;
        let task = match self.tasks.mark_in_progress(&task.id, agent_id).await {
            Ok(task) => task,
            Err(e) if is_lost(&e) => {
                warn!(task_id = %task.id, %agent_id, error = %e, "could not start task");
                return Ok(TaskEnd::Lost);
            }
            Err(e) => return Err(e),
        };
        info!(task_id = %task.id, %agent_id, "task started");
        let started = Instant::now();

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        let mut execution = self.executor.execute(&task);
        let outcome = loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat(state).await {
                        warn!(%agent_id, error = %e, "heartbeat failed");
                    }
                    if let Err(e) = self.tasks.report_progress(&task.id, agent_id, "working").await {
                        warn!(task_id = %task.id, error = %e, "progress report failed");
                    }
                }
                _ = stop.stopped() => {
                    drop(execution);
                    self.release(state, &task.id).await?;
                    return Ok(TaskEnd::Interrupted);
                }
            }
        };
        drop(execution);
        global_metrics().record_histogram(
            names::TASK_EXECUTION_DURATION,
            started.elapsed().as_secs_f64(),
        );

        let end = match outcome {
            ExecutionOutcome::Succeeded { results } => self.finish(state, &task, results).await?,
            ExecutionOutcome::Failed { reason } => self.block(state, &task, &reason).await?,
            ExecutionOutcome::GaveUp { reason } => {
                info!(task_id = %task.id, %reason, "giving task back");
                self.release(state, &task.id).await?
            }
        };
        Ok(end)
    }

    async fn finish(
        &self,
        state: &mut RunState,
        task: &Task,
        results: Vec<cv_core::types::VerificationResult>,
    ) -> Result<TaskEnd> {
        for r in &results {
            match self
                .tasks
                .record_verification(&task.id, &r.criterion, r.passed, &r.detail)
                .await
            {
                Ok(_) => {}
                Err(CoordError::Precondition(Precondition::UnknownCriterion { criterion, .. })) => {
                    warn!(task_id = %task.id, %criterion, "executor reported unknown criterion");
                }
                Err(e) => return Err(e),
            }
        }

        match self.tasks.complete(&task.id, state.agent.id).await {
            Ok(_) => {
                state.report.completed.push(task.id.clone());
                Ok(TaskEnd::Completed)
            }
            Err(CoordError::Precondition(Precondition::AcceptanceNotMet { unmet, .. })) => {
                let reason = format!("acceptance criteria not met: {}", unmet.join(", "));
                self.block(state, task, &reason).await
            }
            Err(e) if is_lost(&e) => {
                warn!(task_id = %task.id, error = %e, "lost ownership before completing");
                Ok(TaskEnd::Lost)
            }
            Err(e) => Err(e),
        }
    }

    async fn block(&self, state: &mut RunState, task: &Task, reason: &str) -> Result<TaskEnd> {
        match self.tasks.block(&task.id, state.agent.id, reason).await {
            Ok(_) => {}
            Err(e) if is_lost(&e) => {
                warn!(task_id = %task.id, error = %e, "lost ownership before blocking");
                return Ok(TaskEnd::Lost);
            }
            Err(e) => return Err(e),
        }
        self.escalations
            .create(&task.id, reason, Severity::High)
            .await?;
        state.report.blocked.push(task.id.clone());
        Ok(TaskEnd::Blocked)
    }

    async fn release(&self, state: &mut RunState, task_id: &str) -> Result<TaskEnd> {
        match self.tasks.release(task_id, state.agent.id).await {
            Ok(_) => {
                state.report.released.push(task_id.to_string());
                Ok(TaskEnd::Released)
            }
            Err(e) if is_lost(&e) => Ok(TaskEnd::Lost),
            Err(e) => {
                error!(%task_id, error = %e, "failed to release task");
                Err(e)
            }
        }
    }
}

fn is_lost(err: &CoordError) -> bool {
    matches!(
        err,
        CoordError::Conflict { .. }
            | CoordError::Precondition(Precondition::NotOwner { .. })
            | CoordError::Precondition(Precondition::InvalidTransition { .. })
    )
}
