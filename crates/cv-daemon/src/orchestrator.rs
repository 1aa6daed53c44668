//! The orchestrator engine.
//!
//! One run drives one epic through
//! `Planning -> Assigning -> Monitoring -> {Checkpointing | Completed | Stalled}`.
//! All coordination goes through the shared store: the orchestrator reads
//! task state, offers (or, in direct mode, claims) ready tasks and watches the
//! event log for motion. It never holds work in memory that a restart would
//! lose; a resumed run rebuilds its view from the checkpoint cursor forward.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cv_agents::assignment::GuardedClaim;
use cv_agents::registry::{AgentFilter, AgentRegistry};
use cv_core::checkpoint::{CheckpointFilter, CheckpointManager};
use cv_core::config::OrchestratorConfig;
use cv_core::db::CoordDb;
use cv_core::error::{CoordError, Precondition, Result};
use cv_core::event_log::EventLog;
use cv_core::events::Event;
use cv_core::graph;
use cv_core::task_store::{TaskFilter, TaskStore};
use cv_core::types::{Agent, AgentId, NewCheckpoint, Task, TaskId, TaskStatus};
use cv_harness::shutdown::{ShutdownSignal, StopListener, StopReason};
use cv_telemetry::metrics::{global_metrics, names};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::scheduler::{AssignmentScheduler, Choice};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// Checkpoint saved; restart with `--resume`.
pub const EXIT_RESUME: i32 = 75;

const EVENT_SCAN_BATCH: usize = 500;

// ---------------------------------------------------------------------------
// Options & outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMode {
    /// Append `task.offered`; the worker claims.
    Supervised,
    /// Claim on the agent's behalf through the capability guard.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeFrom {
    /// Latest orchestrator checkpoint of the epic.
    Latest,
    Checkpoint(Uuid),
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub sprint_id: String,
    pub poll_interval: Duration,
    pub max_runtime: Option<Duration>,
    pub stall_polls: u32,
    /// An unanswered offer is repeated after this long.
    pub offer_ttl: Duration,
    pub mode: AssignmentMode,
    pub resume: Option<ResumeFrom>,
}

impl OrchestratorOptions {
    pub fn from_config(cfg: &OrchestratorConfig, sprint_id: impl Into<String>) -> Self {
        Self {
            sprint_id: sprint_id.into(),
            poll_interval: cfg.poll_interval(),
            max_runtime: cfg.max_runtime(),
            stall_polls: cfg.stall_polls,
            offer_ttl: cfg.poll_interval() * 3,
            mode: AssignmentMode::Supervised,
            resume: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Stalled { incomplete: Vec<TaskId> },
    CheckpointSaved { checkpoint_id: Uuid, event_cursor: u64 },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => EXIT_SUCCESS,
            RunOutcome::Stalled { .. } => EXIT_FAILURE,
            RunOutcome::CheckpointSaved { .. } => EXIT_RESUME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub sprint_id: String,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    pub cycles: u32,
    pub assignments: u32,
    pub resumed_from: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Assign { agent_id: AgentId, agent_name: String },
    WaitingOnDependencies { pending: Vec<TaskId> },
    NoCapableAgent,
    AllBusy,
    /// Not `todo`; nothing to assign.
    Status { status: TaskStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunRow {
    pub task_id: TaskId,
    pub title: String,
    #[serde(flatten)]
    pub decision: Decision,
}

impl fmt::Display for DryRunRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<16} ", self.task_id)?;
        match &self.decision {
            Decision::Assign {
                agent_id,
                agent_name,
            } => write!(f, "assign -> {agent_name} ({agent_id})"),
            Decision::WaitingOnDependencies { pending } => {
                write!(f, "waiting on dependencies: {}", pending.join(", "))
            }
            Decision::NoCapableAgent => f.write_str("no capable agent"),
            Decision::AllBusy => f.write_str("all capable agents busy"),
            Decision::Status { status } => write!(f, "{status}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Offer {
    agent_id: AgentId,
    at: DateTime<Utc>,
}

/// Monitoring view of one run.
#[derive(Debug, Default)]
struct RunState {
    /// Last event examined.
    cursor: u64,
    offers: HashMap<TaskId, Offer>,
    fingerprint: Option<BTreeMap<TaskId, (TaskStatus, Option<AgentId>)>>,
    idle_polls: u32,
    cycles: u32,
    assignments: u32,
}

enum Step {
    Continue,
    Finished(RunOutcome),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    tasks: TaskStore,
    registry: AgentRegistry,
    claims: GuardedClaim,
    checkpoints: CheckpointManager,
    events: EventLog,
    scheduler: AssignmentScheduler,
    options: OrchestratorOptions,
    shutdown: ShutdownSignal,
}

impl Orchestrator {
    pub fn new(
        db: Arc<CoordDb>,
        stale_threshold: Duration,
        options: OrchestratorOptions,
        shutdown: ShutdownSignal,
    ) -> Self {
        let tasks = TaskStore::new(Arc::clone(&db));
        let registry = AgentRegistry::new(Arc::clone(&db), stale_threshold);
        Self {
            claims: GuardedClaim::new(registry.clone(), tasks.clone()),
            checkpoints: CheckpointManager::new(Arc::clone(&db)),
            events: EventLog::new(db),
            scheduler: AssignmentScheduler::new(stale_threshold),
            tasks,
            registry,
            options,
            shutdown,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Drive the epic until it completes, stalls or checkpoints.
    ///
    /// Transient store errors are logged and the cycle is retried on the next
    /// poll; anything else aborts the run.
    pub async fn run(&self) -> Result<RunReport> {
        let sprint = self.options.sprint_id.clone();
        let started = Instant::now();

        let order = self.plan().await?;
        info!(sprint_id = %sprint, tasks = order.len(), mode = ?self.options.mode, "plan ready");

        let (mut state, resumed_from) = self.initial_state().await?;
        let mut stop = self.shutdown.subscribe();

        loop {
            state.cycles += 1;
            global_metrics().increment_counter(names::ORCHESTRATOR_CYCLES_TOTAL, &[]);

            let failed = match self.cycle(&mut state, started).await {
                Ok(Step::Finished(outcome)) => {
                    info!(sprint_id = %sprint, ?outcome, cycles = state.cycles, "run finished");
                    return Ok(RunReport {
                        sprint_id: sprint,
                        outcome,
                        cycles: state.cycles,
                        assignments: state.assignments,
                        resumed_from,
                    });
                }
                Ok(Step::Continue) => false,
                Err(e) if e.is_transient() => {
                    warn!(sprint_id = %sprint, error = %e, "cycle failed, retrying next poll");
                    true
                }
                Err(e) => {
                    error!(sprint_id = %sprint, error = %e, "run aborted");
                    return Err(e);
                }
            };
            self.pause(&mut stop, failed).await;
        }
    }

    /// Wait before the next cycle. A stop request cuts a normal poll short;
    /// the wait after a failed cycle always runs in full.
    async fn pause(&self, stop: &mut StopListener, after_failure: bool) {
        if after_failure {
            tokio::time::sleep(self.options.poll_interval).await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.options.poll_interval) => {}
            reason = stop.stopped() => {
                debug!(?reason, "stop requested, checkpointing on next cycle");
            }
        }
    }

    /// Validate the epic: it exists, its graph is acyclic and every
    /// dependency outside it exists. Returns the topological order.
    async fn plan(&self) -> Result<Vec<TaskId>> {
        let sprint = &self.options.sprint_id;
        let tasks = self.tasks.list(TaskFilter::sprint(sprint.as_str())).await?;
        if tasks.is_empty() {
            return Err(CoordError::not_found("sprint", sprint));
        }
        let order = graph::topological_order(&tasks)?;

        let external = external_dependencies(&tasks);
        if !external.is_empty() {
            let known = self.tasks.statuses(external.clone()).await?;
            let missing: Vec<&TaskId> = external.iter().filter(|d| !known.contains_key(*d)).collect();
            if !missing.is_empty() {
                return Err(CoordError::Fatal(format!(
                    "epic `{sprint}` depends on unknown tasks {missing:?}"
                )));
            }
        }
        Ok(order)
    }

    async fn initial_state(&self) -> Result<(RunState, Option<Uuid>)> {
        let sprint = &self.options.sprint_id;
        let checkpoint = match &self.options.resume {
            None => None,
            Some(ResumeFrom::Checkpoint(id)) => {
                let cp = self.checkpoints.get(*id).await?;
                if cp.task_id.is_some() || cp.sprint_id.as_deref() != Some(sprint.as_str()) {
                    return Err(Precondition::Invalid(format!(
                        "checkpoint {id} is not an orchestrator checkpoint of `{sprint}`"
                    ))
                    .into());
                }
                Some(cp)
            }
            Some(ResumeFrom::Latest) => {
                let latest = self
                    .checkpoints
                    .latest(CheckpointFilter::orchestrator(sprint.as_str()))
                    .await?;
                if latest.is_none() {
                    warn!(sprint_id = %sprint, "no checkpoint to resume from, starting fresh");
                }
                latest
            }
        };

        let mut state = RunState::default();
        match checkpoint {
            Some(cp) => {
                info!(sprint_id = %sprint, checkpoint_id = %cp.id, cursor = cp.event_cursor, "resuming");
                state.cursor = cp.event_cursor;
                Ok((state, Some(cp.id)))
            }
            None => {
                state.cursor = self.events.head().await?;
                Ok((state, None))
            }
        }
    }

    async fn cycle(&self, state: &mut RunState, started: Instant) -> Result<Step> {
        let sprint = self.options.sprint_id.clone();
        self.registry.detect_stale().await?;

        let tasks = self.tasks.list(TaskFilter::sprint(sprint.as_str())).await?;
        let incomplete: Vec<TaskId> = tasks
            .iter()
            .filter(|t| !t.is_complete())
            .map(|t| t.id.clone())
            .collect();
        global_metrics().set_gauge(names::TASKS_INCOMPLETE, &[], incomplete.len() as i64);

        if incomplete.is_empty() {
            self.events
                .append(Event::SprintCompleted {
                    sprint_id: sprint.clone(),
                })
                .await?;
            return Ok(Step::Finished(RunOutcome::Completed));
        }

        let runtime_over = self
            .options
            .max_runtime
            .is_some_and(|max| started.elapsed() >= max);
        if runtime_over || self.shutdown.reason().is_some() {
            let reason = match self.shutdown.reason() {
                Some(StopReason::Checkpoint) => "checkpoint requested",
                Some(StopReason::Shutdown) => "shutdown",
                None => "max runtime reached",
            };
            let done = tasks.len() - incomplete.len();
            let cp = self
                .checkpoints
                .create(NewCheckpoint {
                    sprint_id: Some(sprint.clone()),
                    message: format!("{reason}: {done}/{} tasks complete", tasks.len()),
                    ..NewCheckpoint::default()
                })
                .await?;
            info!(sprint_id = %sprint, checkpoint_id = %cp.id, reason, "checkpoint saved");
            return Ok(Step::Finished(RunOutcome::CheckpointSaved {
                checkpoint_id: cp.id,
                event_cursor: cp.event_cursor,
            }));
        }

        let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let saw_events = self.scan_events(state, &ids).await?;
        let fingerprint: BTreeMap<TaskId, (TaskStatus, Option<AgentId>)> = tasks
            .iter()
            .map(|t| (t.id.clone(), (t.status, t.claimed_by)))
            .collect();
        let changed = state.fingerprint.as_ref() != Some(&fingerprint);
        state.fingerprint = Some(fingerprint);

        if changed || saw_events {
            state.idle_polls = 0;
        } else {
            state.idle_polls += 1;
            debug!(sprint_id = %sprint, idle_polls = state.idle_polls, "no progress this poll");
            if state.idle_polls >= self.options.stall_polls {
                warn!(sprint_id = %sprint, ?incomplete, "run stalled");
                self.events
                    .append(Event::SprintStalled {
                        sprint_id: sprint,
                        incomplete: incomplete.clone(),
                    })
                    .await?;
                return Ok(Step::Finished(RunOutcome::Stalled { incomplete }));
            }
        }

        self.assign(state, &tasks).await?;
        Ok(Step::Continue)
    }

    /// Fold new log events into the run state. Returns true when a `task.*`
    /// event other than an offer touched one of the epic's tasks.
    async fn scan_events(&self, state: &mut RunState, ids: &HashSet<&str>) -> Result<bool> {
        let mut progressed = false;
        loop {
            let batch = self.events.read_from(state.cursor, EVENT_SCAN_BATCH).await?;
            let Some(last) = batch.last() else {
                break;
            };
            state.cursor = last.cursor;
            for record in &batch {
                let Some(task_id) = record.event.task_id() else {
                    continue;
                };
                if !ids.contains(task_id) {
                    continue;
                }
                match &record.event {
                    Event::TaskOffered { task_id, agent_id } => {
                        state.offers.insert(
                            task_id.clone(),
                            Offer {
                                agent_id: *agent_id,
                                at: record.timestamp,
                            },
                        );
                    }
                    _ => progressed = true,
                }
            }
            if batch.len() < EVENT_SCAN_BATCH {
                break;
            }
        }
        Ok(progressed)
    }

    async fn assign(&self, state: &mut RunState, tasks: &[Task]) -> Result<()> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.options.offer_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(15));

        // An offer stays live while its task is still todo and the TTL holds.
        let todo: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Todo)
            .map(|t| t.id.as_str())
            .collect();
        state
            .offers
            .retain(|task_id, offer| todo.contains(task_id.as_str()) && now - offer.at < ttl);

        let statuses = self.statuses_with_external(tasks).await?;
        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let order = graph::topological_order(tasks)?;
        let ready: Vec<&Task> = order
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .filter(|t| t.status == TaskStatus::Todo)
            .filter(|t| !state.offers.contains_key(&t.id))
            .filter(|t| graph::is_ready(t, &statuses))
            .collect();
        if ready.is_empty() {
            return Ok(());
        }

        let agents = self.registry.list(AgentFilter::default()).await?;
        let mut busy: HashSet<AgentId> = busy_agents(tasks);
        busy.extend(state.offers.values().map(|o| o.agent_id));

        for (task_id, choice) in self.scheduler.plan(&ready, &agents, &busy, now) {
            let agent_id = match choice {
                Choice::Assign(agent_id) => agent_id,
                Choice::NoCapableAgent => {
                    debug!(%task_id, "no capable active agent");
                    continue;
                }
                Choice::AllBusy => {
                    debug!(%task_id, "capable agents are busy");
                    continue;
                }
            };
            match self.options.mode {
                AssignmentMode::Supervised => {
                    let cursor = self.registry.record_offer(&task_id, agent_id).await?;
                    state.offers.insert(task_id.clone(), Offer { agent_id, at: now });
                    state.assignments += 1;
                    info!(%task_id, %agent_id, cursor, "task offered");
                }
                AssignmentMode::Direct => match self.claims.claim(&task_id, agent_id).await {
                    Ok(_) => {
                        self.registry.mark_assigned(agent_id).await?;
                        state.assignments += 1;
                        info!(%task_id, %agent_id, "task claimed for agent");
                    }
                    Err(e @ (CoordError::Conflict { .. }
                    | CoordError::Precondition(_)
                    | CoordError::NotFound { .. })) => {
                        debug!(%task_id, %agent_id, error = %e, "direct claim skipped");
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }

    /// Statuses of the epic's tasks plus any dependency outside it.
    async fn statuses_with_external(&self, tasks: &[Task]) -> Result<HashMap<TaskId, TaskStatus>> {
        let mut statuses: HashMap<TaskId, TaskStatus> =
            tasks.iter().map(|t| (t.id.clone(), t.status)).collect();
        let external = external_dependencies(tasks);
        if !external.is_empty() {
            statuses.extend(self.tasks.statuses(external).await?);
        }
        Ok(statuses)
    }

    /// Planning and assignment against a read snapshot; mutates nothing.
    pub async fn dry_run(&self) -> Result<Vec<DryRunRow>> {
        let order = self.plan().await?;
        let tasks = self
            .tasks
            .list(TaskFilter::sprint(self.options.sprint_id.as_str()))
            .await?;
        let statuses = self.statuses_with_external(&tasks).await?;
        let agents: Vec<Agent> = self.registry.list(AgentFilter::default()).await?;
        let agent_names: HashMap<AgentId, &str> = agents.iter().map(|a| (a.id, a.name.as_str())).collect();
        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        let ready: Vec<&Task> = order
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .filter(|t| t.status == TaskStatus::Todo && graph::is_ready(t, &statuses))
            .collect();
        let choices: HashMap<TaskId, Choice> = self
            .scheduler
            .plan(&ready, &agents, &busy_agents(&tasks), Utc::now())
            .into_iter()
            .collect();

        let rows = order
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .map(|task| {
                let decision = if task.status != TaskStatus::Todo {
                    Decision::Status {
                        status: task.status,
                    }
                } else if let Some(choice) = choices.get(&task.id) {
                    match choice {
                        Choice::Assign(agent_id) => Decision::Assign {
                            agent_id: *agent_id,
                            agent_name: agent_names.get(agent_id).copied().unwrap_or_default().to_string(),
                        },
                        Choice::NoCapableAgent => Decision::NoCapableAgent,
                        Choice::AllBusy => Decision::AllBusy,
                    }
                } else {
                    Decision::WaitingOnDependencies {
                        pending: task
                            .dependencies
                            .iter()
                            .filter(|d| statuses.get(*d) != Some(&TaskStatus::Complete))
                            .cloned()
                            .collect(),
                    }
                };
                DryRunRow {
                    task_id: task.id.clone(),
                    title: task.title.clone(),
                    decision,
                }
            })
            .collect();
        Ok(rows)
    }
}

fn external_dependencies(tasks: &[Task]) -> Vec<TaskId> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut external: Vec<TaskId> = tasks
        .iter()
        .flat_map(|t| t.dependencies.iter())
        .filter(|d| !ids.contains(d.as_str()))
        .cloned()
        .collect();
    external.sort();
    external.dedup();
    external
}

/// Agents currently holding a claimed or in-progress task.
fn busy_agents(tasks: &[Task]) -> HashSet<AgentId> {
    tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Claimed | TaskStatus::InProgress))
        .filter_map(|t| t.claimed_by)
        .collect()
}
