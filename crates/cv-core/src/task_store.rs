//! Task records and the claim protocol.
//!
//! Every mutation is a compare-and-set against the task's current
//! `(status, claimed_by)` pair, committed together with its event. Exclusion
//! is scoped to one task row; unrelated tasks never contend.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use cv_telemetry::metrics::{global_metrics, names};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::{sql, CoordDb, WriteTx};
use crate::error::{CoordError, Precondition, Result};
use crate::events::{Event, ReleaseReason};
use crate::types::{AgentId, NewTask, Task, TaskId, TaskStatus, VerificationResult};

/// Detail reported for criteria with no recorded result.
pub const NOT_VERIFIED: &str = "not verified";

const TASK_COLUMNS: &str = "id, sprint_id, title, description, status, dependencies, claimed_by, \
     completed_by, required_capabilities, acceptance_criteria, block_reason, created_at, updated_at";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub sprint_id: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub claimed_by: Option<AgentId>,
}

impl TaskFilter {
    pub fn sprint(sprint_id: impl Into<String>) -> Self {
        Self {
            sprint_id: Some(sprint_id.into()),
            ..Self::default()
        }
    }
}

/// Result of a bulk import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub created: Vec<TaskId>,
    pub skipped: Vec<TaskId>,
}

#[derive(Clone)]
pub struct TaskStore {
    db: Arc<CoordDb>,
}

impl TaskStore {
    pub fn new(db: Arc<CoordDb>) -> Self {
        Self { db }
    }

    // -----------------------------------------------------------------------
    // Creation & reads
    // -----------------------------------------------------------------------

    pub async fn create(&self, new: NewTask) -> Result<Task> {
        self.db
            .write(move |tx| {
                if load(tx.conn(), &new.id)?.is_some() {
                    return Err(Precondition::AlreadyExists {
                        entity: "task",
                        id: new.id.clone(),
                    }
                    .into());
                }
                insert(tx, &new)
            })
            .await
    }

    /// Create every task that does not exist yet; existing IDs are skipped.
    pub async fn import(&self, tasks: Vec<NewTask>) -> Result<ImportSummary> {
        let summary = self
            .db
            .write(move |tx| {
                let mut summary = ImportSummary::default();
                for new in &tasks {
                    if load(tx.conn(), &new.id)?.is_some() {
                        summary.skipped.push(new.id.clone());
                    } else {
                        insert(tx, new)?;
                        summary.created.push(new.id.clone());
                    }
                }
                Ok(summary)
            })
            .await?;
        info!(
            created = summary.created.len(),
            skipped = summary.skipped.len(),
            "tasks imported"
        );
        Ok(summary)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        let id = task_id.to_string();
        self.db
            .read(move |conn| load(conn, &id)?.ok_or_else(|| CoordError::not_found("task", id)))
            .await
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE (?1 IS NULL OR sprint_id = ?1)
                       AND (?2 IS NULL OR status = ?2)
                       AND (?3 IS NULL OR claimed_by = ?3)
                     ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt.query_map(
                    params![
                        filter.sprint_id,
                        filter.status.map(|s| s.as_str()),
                        filter.claimed_by.map(|a| a.to_string()),
                    ],
                    row_to_task,
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    /// Status of each requested task; unknown IDs are absent from the map.
    pub async fn statuses(&self, ids: Vec<TaskId>) -> Result<HashMap<TaskId, TaskStatus>> {
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare("SELECT status FROM tasks WHERE id = ?1")?;
                let mut out = HashMap::new();
                for id in ids {
                    let status: Option<String> =
                        stmt.query_row(params![id], |row| row.get(0)).optional()?;
                    if let Some(status) = status {
                        out.insert(id, sql::parse_enum(0, &status)?);
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Dependencies of `task` that are not yet `complete`, sorted.
    pub async fn pending_dependencies(&self, task: &Task) -> Result<Vec<TaskId>> {
        let statuses = self
            .statuses(task.dependencies.iter().cloned().collect())
            .await?;
        Ok(task
            .dependencies
            .iter()
            .filter(|dep| statuses.get(*dep) != Some(&TaskStatus::Complete))
            .cloned()
            .collect())
    }

    // -----------------------------------------------------------------------
    // Claim protocol
    // -----------------------------------------------------------------------

    /// Take ownership of a `todo` task. Losing a race is `Conflict`.
    pub async fn claim(&self, task_id: &str, agent_id: AgentId) -> Result<Task> {
        let id = task_id.to_string();
        let task = self
            .db
            .write(move |tx| {
                let task = require(tx.conn(), &id)?;
                if task.status != TaskStatus::Todo {
                    return Err(conflict(&task));
                }
                let mut next = task.clone();
                next.status = TaskStatus::Claimed;
                next.claimed_by = Some(agent_id);
                transition(tx, &task, next, Event::TaskClaimed {
                    task_id: id.clone(),
                    agent_id,
                })
            })
            .await?;
        info!(task_id = %task.id, %agent_id, "task claimed");
        Ok(task)
    }

    /// Give a task back to the pool.
    pub async fn release(&self, task_id: &str, agent_id: AgentId) -> Result<Task> {
        let id = task_id.to_string();
        let task = self
            .db
            .write(move |tx| {
                let task = require(tx.conn(), &id)?;
                require_owner(&task, agent_id)?;
                require_status(
                    &task,
                    &[TaskStatus::Claimed, TaskStatus::InProgress, TaskStatus::Blocked],
                    TaskStatus::Todo,
                )?;
                let next = released(&task);
                transition(tx, &task, next, Event::TaskReleased {
                    task_id: id.clone(),
                    agent_id,
                    reason: ReleaseReason::Voluntary,
                })
            })
            .await?;
        info!(task_id = %task.id, %agent_id, "task released");
        Ok(task)
    }

    pub async fn mark_in_progress(&self, task_id: &str, agent_id: AgentId) -> Result<Task> {
        let id = task_id.to_string();
        self.db
            .write(move |tx| {
                let task = require(tx.conn(), &id)?;
                require_owner(&task, agent_id)?;
                require_status(
                    &task,
                    &[TaskStatus::Claimed, TaskStatus::Blocked],
                    TaskStatus::InProgress,
                )?;
                let mut next = task.clone();
                next.status = TaskStatus::InProgress;
                next.block_reason = None;
                transition(tx, &task, next, Event::TaskStarted {
                    task_id: id.clone(),
                    agent_id,
                })
            })
            .await
    }

    /// Finish a task. Every acceptance criterion must have a passing result.
    pub async fn complete(&self, task_id: &str, agent_id: AgentId) -> Result<Task> {
        let id = task_id.to_string();
        let task = self
            .db
            .write(move |tx| {
                let task = require(tx.conn(), &id)?;
                require_owner(&task, agent_id)?;
                require_status(
                    &task,
                    &[TaskStatus::Claimed, TaskStatus::InProgress],
                    TaskStatus::Complete,
                )?;
                let unmet: Vec<String> = verification_results(tx.conn(), &task)?
                    .into_iter()
                    .filter(|r| !r.passed)
                    .map(|r| r.criterion)
                    .collect();
                if !unmet.is_empty() {
                    return Err(Precondition::AcceptanceNotMet {
                        task_id: id.clone(),
                        unmet,
                    }
                    .into());
                }
                let mut next = task.clone();
                next.status = TaskStatus::Complete;
                next.claimed_by = None;
                next.completed_by = Some(agent_id);
                transition(tx, &task, next, Event::TaskCompleted {
                    task_id: id.clone(),
                    agent_id,
                })
            })
            .await?;
        info!(task_id = %task.id, %agent_id, "task completed");
        Ok(task)
    }

    /// Mark a task blocked. The owner stays responsible for it.
    pub async fn block(&self, task_id: &str, agent_id: AgentId, reason: &str) -> Result<Task> {
        let id = task_id.to_string();
        let reason = reason.to_string();
        let task = self
            .db
            .write(move |tx| {
                let task = require(tx.conn(), &id)?;
                require_owner(&task, agent_id)?;
                require_status(
                    &task,
                    &[TaskStatus::Claimed, TaskStatus::InProgress],
                    TaskStatus::Blocked,
                )?;
                let mut next = task.clone();
                next.status = TaskStatus::Blocked;
                next.block_reason = Some(reason.clone());
                transition(tx, &task, next, Event::TaskBlocked {
                    task_id: id.clone(),
                    agent_id,
                    reason,
                })
            })
            .await?;
        info!(task_id = %task.id, %agent_id, "task blocked");
        Ok(task)
    }

    /// Append `task.progress` for a task the agent owns. No state changes.
    pub async fn report_progress(&self, task_id: &str, agent_id: AgentId, note: &str) -> Result<u64> {
        let id = task_id.to_string();
        let note = note.to_string();
        self.db
            .write(move |tx| {
                let task = require(tx.conn(), &id)?;
                require_owner(&task, agent_id)?;
                tx.append(&Event::TaskProgress {
                    task_id: id,
                    agent_id,
                    note,
                })
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Verification
    // -----------------------------------------------------------------------

    /// Record the outcome of an externally executed acceptance check.
    pub async fn record_verification(
        &self,
        task_id: &str,
        criterion: &str,
        passed: bool,
        detail: &str,
    ) -> Result<VerificationResult> {
        let id = task_id.to_string();
        let result = VerificationResult {
            criterion: criterion.to_string(),
            passed,
            detail: detail.to_string(),
        };
        self.db
            .write(move |tx| {
                let task = require(tx.conn(), &id)?;
                if !task.acceptance_criteria.contains(&result.criterion) {
                    return Err(Precondition::UnknownCriterion {
                        task_id: id.clone(),
                        criterion: result.criterion.clone(),
                    }
                    .into());
                }
                upsert_verification(tx, &id, &result)?;
                tx.append(&Event::TaskVerified {
                    task_id: id.clone(),
                    criterion: result.criterion.clone(),
                    passed: result.passed,
                    detail: result.detail.clone(),
                })?;
                debug!(task_id = %id, criterion = %result.criterion, passed, "verification recorded");
                Ok(result)
            })
            .await
    }

    /// One result per acceptance criterion, in criterion order.
    pub async fn verify(&self, task_id: &str) -> Result<Vec<VerificationResult>> {
        let id = task_id.to_string();
        self.db
            .read(move |conn| {
                let task = require(conn, &id)?;
                verification_results(conn, &task)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Transaction-scoped helpers
// ---------------------------------------------------------------------------

/// Release every `claimed` / `in_progress` task owned by `agent_id` inside an
/// existing transaction. Blocked tasks keep their owner.
pub fn release_owned_tx(
    tx: &mut WriteTx<'_>,
    agent_id: AgentId,
    reason: ReleaseReason,
) -> Result<Vec<TaskId>> {
    let owned: Vec<Task> = {
        let mut stmt = tx.conn().prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE claimed_by = ?1 AND status IN ('claimed', 'in_progress')
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![agent_id.to_string()], row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    let mut released_ids = Vec::with_capacity(owned.len());
    for task in owned {
        let next = released(&task);
        transition(tx, &task, next, Event::TaskReleased {
            task_id: task.id.clone(),
            agent_id,
            reason,
        })?;
        released_ids.push(task.id);
    }
    Ok(released_ids)
}

fn insert(tx: &mut WriteTx<'_>, new: &NewTask) -> Result<Task> {
    let now = tx.now();
    let task = Task {
        id: new.id.clone(),
        sprint_id: new.sprint_id.clone(),
        title: new.title.clone(),
        description: new.description.clone(),
        status: TaskStatus::Todo,
        dependencies: new.dependencies.clone(),
        claimed_by: None,
        completed_by: None,
        required_capabilities: new.required_capabilities.clone(),
        acceptance_criteria: new.acceptance_criteria.clone(),
        block_reason: None,
        created_at: now,
        updated_at: now,
    };
    tx.conn().execute(
        &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
        params![
            task.id,
            task.sprint_id,
            task.title,
            task.description,
            task.status.as_str(),
            serde_json::to_string(&task.dependencies)?,
            Option::<String>::None,
            Option::<String>::None,
            serde_json::to_string(&task.required_capabilities)?,
            serde_json::to_string(&task.acceptance_criteria)?,
            Option::<String>::None,
            sql::ts(now),
            sql::ts(now),
        ],
    )?;
    tx.append(&Event::TaskCreated { task: new.clone() })?;
    Ok(task)
}

/// Compare-and-set `task` to `next`, then append `event`.
fn transition(tx: &mut WriteTx<'_>, task: &Task, mut next: Task, event: Event) -> Result<Task> {
    next.updated_at = tx.now();
    let changed = tx.conn().execute(
        "UPDATE tasks
         SET status = ?1, claimed_by = ?2, completed_by = ?3, block_reason = ?4, updated_at = ?5
         WHERE id = ?6 AND status = ?7 AND claimed_by IS ?8",
        params![
            next.status.as_str(),
            next.claimed_by.map(|a| a.to_string()),
            next.completed_by.map(|a| a.to_string()),
            next.block_reason,
            sql::ts(next.updated_at),
            task.id,
            task.status.as_str(),
            task.claimed_by.map(|a| a.to_string()),
        ],
    )?;
    if changed == 0 {
        let current = require(tx.conn(), &task.id)?;
        return Err(conflict(&current));
    }
    tx.append(&event)?;
    global_metrics().increment_counter(
        names::TASK_TRANSITIONS_TOTAL,
        &[("from", task.status.as_str()), ("to", next.status.as_str())],
    );
    Ok(next)
}

fn released(task: &Task) -> Task {
    let mut next = task.clone();
    next.status = TaskStatus::Todo;
    next.claimed_by = None;
    next.block_reason = None;
    next
}

fn conflict(task: &Task) -> CoordError {
    CoordError::Conflict {
        task_id: task.id.clone(),
        status: task.status.to_string(),
    }
}

fn require_owner(task: &Task, agent_id: AgentId) -> Result<()> {
    if task.claimed_by == Some(agent_id) {
        Ok(())
    } else {
        Err(Precondition::NotOwner {
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
        }
        .into())
    }
}

fn require_status(task: &Task, allowed: &[TaskStatus], to: TaskStatus) -> Result<()> {
    if allowed.contains(&task.status) {
        Ok(())
    } else {
        Err(Precondition::InvalidTransition {
            task_id: task.id.clone(),
            from: task.status.to_string(),
            to: to.to_string(),
        }
        .into())
    }
}

fn require(conn: &rusqlite::Connection, id: &str) -> Result<Task> {
    load(conn, id)?.ok_or_else(|| CoordError::not_found("task", id))
}

fn load(conn: &rusqlite::Connection, id: &str) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            row_to_task,
        )
        .optional()?;
    Ok(task)
}

fn upsert_verification(tx: &WriteTx<'_>, task_id: &str, result: &VerificationResult) -> Result<()> {
    tx.conn().execute(
        "INSERT INTO verifications (task_id, criterion, passed, detail, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(task_id, criterion) DO UPDATE SET
            passed = excluded.passed,
            detail = excluded.detail,
            recorded_at = excluded.recorded_at",
        params![
            task_id,
            result.criterion,
            result.passed,
            result.detail,
            sql::ts(tx.now()),
        ],
    )?;
    Ok(())
}

fn verification_results(conn: &rusqlite::Connection, task: &Task) -> Result<Vec<VerificationResult>> {
    let mut stmt =
        conn.prepare("SELECT criterion, passed, detail FROM verifications WHERE task_id = ?1")?;
    let recorded: HashMap<String, (bool, String)> = stmt
        .query_map(params![task.id], |row| {
            Ok((row.get::<_, String>(0)?, (row.get(1)?, row.get(2)?)))
        })?
        .collect::<rusqlite::Result<_>>()?;

    Ok(task
        .acceptance_criteria
        .iter()
        .map(|criterion| match recorded.get(criterion) {
            Some((passed, detail)) => VerificationResult {
                criterion: criterion.clone(),
                passed: *passed,
                detail: detail.clone(),
            },
            None => VerificationResult {
                criterion: criterion.clone(),
                passed: false,
                detail: NOT_VERIFIED.to_string(),
            },
        })
        .collect())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    let dependencies: String = row.get(5)?;
    let required: String = row.get(8)?;
    let criteria: String = row.get(9)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    Ok(Task {
        id: row.get(0)?,
        sprint_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: sql::parse_enum(4, &status)?,
        dependencies: sql::parse_json::<BTreeSet<String>>(5, &dependencies)?,
        claimed_by: sql::parse_opt_uuid(6, row.get(6)?)?,
        completed_by: sql::parse_opt_uuid(7, row.get(7)?)?,
        required_capabilities: sql::parse_json(8, &required)?,
        acceptance_criteria: sql::parse_json(9, &criteria)?,
        block_reason: row.get(10)?,
        created_at: sql::parse_ts(11, &created_at)?,
        updated_at: sql::parse_ts(12, &updated_at)?,
    })
}
