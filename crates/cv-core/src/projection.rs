//! Rebuild task state by folding the event log.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::{Event, EventRecord};
use crate::task_store::NOT_VERIFIED;
use crate::types::{AgentId, Task, TaskId, TaskStatus, VerificationResult};

/// The replayable part of a task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub sprint_id: String,
    pub status: TaskStatus,
    pub claimed_by: Option<AgentId>,
    pub completed_by: Option<AgentId>,
    pub block_reason: Option<String>,
    pub verifications: Vec<VerificationResult>,
}

impl TaskView {
    /// View of a live task together with its `verify` results.
    pub fn from_live(task: &Task, verifications: Vec<VerificationResult>) -> Self {
        Self {
            id: task.id.clone(),
            sprint_id: task.sprint_id.clone(),
            status: task.status,
            claimed_by: task.claimed_by,
            completed_by: task.completed_by,
            block_reason: task.block_reason.clone(),
            verifications,
        }
    }
}

/// In-memory task map built from events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    pub tasks: BTreeMap<TaskId, TaskView>,
    /// Cursor of the last folded event.
    pub cursor: u64,
}

impl Projection {
    pub fn replay<'a>(records: impl IntoIterator<Item = &'a EventRecord>) -> Self {
        let mut projection = Self::default();
        for record in records {
            projection.apply(record);
        }
        projection
    }

    pub fn apply(&mut self, record: &EventRecord) {
        self.cursor = self.cursor.max(record.cursor);
        match &record.event {
            Event::TaskCreated { task } => {
                self.tasks.entry(task.id.clone()).or_insert_with(|| TaskView {
                    id: task.id.clone(),
                    sprint_id: task.sprint_id.clone(),
                    status: TaskStatus::Todo,
                    claimed_by: None,
                    completed_by: None,
                    block_reason: None,
                    verifications: task
                        .acceptance_criteria
                        .iter()
                        .map(|c| VerificationResult {
                            criterion: c.clone(),
                            passed: false,
                            detail: NOT_VERIFIED.to_string(),
                        })
                        .collect(),
                });
            }
            Event::TaskClaimed { task_id, agent_id } => self.update(task_id, |t| {
                t.status = TaskStatus::Claimed;
                t.claimed_by = Some(*agent_id);
            }),
            Event::TaskReleased { task_id, .. } => self.update(task_id, |t| {
                t.status = TaskStatus::Todo;
                t.claimed_by = None;
                t.block_reason = None;
            }),
            Event::TaskStarted { task_id, .. } => self.update(task_id, |t| {
                t.status = TaskStatus::InProgress;
                t.block_reason = None;
            }),
            Event::TaskBlocked {
                task_id, reason, ..
            } => self.update(task_id, |t| {
                t.status = TaskStatus::Blocked;
                t.block_reason = Some(reason.clone());
            }),
            Event::TaskCompleted { task_id, agent_id } => self.update(task_id, |t| {
                t.status = TaskStatus::Complete;
                t.claimed_by = None;
                t.completed_by = Some(*agent_id);
            }),
            Event::TaskVerified {
                task_id,
                criterion,
                passed,
                detail,
            } => self.update(task_id, |t| {
                if let Some(v) = t.verifications.iter_mut().find(|v| &v.criterion == criterion) {
                    v.passed = *passed;
                    v.detail = detail.clone();
                }
            }),
            _ => {}
        }
    }

    fn update(&mut self, task_id: &str, f: impl FnOnce(&mut TaskView)) {
        if let Some(view) = self.tasks.get_mut(task_id) {
            f(view);
        }
    }
}
