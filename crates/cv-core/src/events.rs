//! Typed event vocabulary for the per-project event log.
//!
//! [`Event`] is a closed set of kinds, each with a typed payload. The wire
//! form is [`RawEvent`] (`{"type": ..., "payload": ...}`); anything that does
//! not parse into a known kind is routed to the dead-letter queue by the
//! consumer instead of being guessed at.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoordError, Precondition};
use crate::types::{AgentId, AgentStatus, NewTask, Severity, TaskId};

/// Why a claimed task went back to `todo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Voluntary,
    Deregistered,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    #[serde(rename = "agent.registered")]
    AgentRegistered {
        agent_id: AgentId,
        name: String,
        capabilities: BTreeSet<String>,
    },
    #[serde(rename = "agent.heartbeat")]
    AgentHeartbeat {
        agent_id: AgentId,
        #[serde(default)]
        status: Option<AgentStatus>,
    },
    #[serde(rename = "agent.deregistered")]
    AgentDeregistered {
        agent_id: AgentId,
        #[serde(default)]
        released: Vec<TaskId>,
    },
    #[serde(rename = "agent.stale")]
    AgentStale {
        agent_id: AgentId,
        last_heartbeat: DateTime<Utc>,
        #[serde(default)]
        released: Vec<TaskId>,
    },
    #[serde(rename = "task.created")]
    TaskCreated { task: NewTask },
    #[serde(rename = "task.offered")]
    TaskOffered { task_id: TaskId, agent_id: AgentId },
    #[serde(rename = "task.claimed")]
    TaskClaimed { task_id: TaskId, agent_id: AgentId },
    #[serde(rename = "task.released")]
    TaskReleased {
        task_id: TaskId,
        agent_id: AgentId,
        reason: ReleaseReason,
    },
    #[serde(rename = "task.started")]
    TaskStarted { task_id: TaskId, agent_id: AgentId },
    #[serde(rename = "task.progress")]
    TaskProgress {
        task_id: TaskId,
        agent_id: AgentId,
        #[serde(default)]
        note: String,
    },
    #[serde(rename = "task.verified")]
    TaskVerified {
        task_id: TaskId,
        criterion: String,
        passed: bool,
        #[serde(default)]
        detail: String,
    },
    #[serde(rename = "task.completed")]
    TaskCompleted { task_id: TaskId, agent_id: AgentId },
    #[serde(rename = "task.blocked")]
    TaskBlocked {
        task_id: TaskId,
        agent_id: AgentId,
        reason: String,
    },
    #[serde(rename = "checkpoint.created")]
    CheckpointCreated {
        checkpoint_id: Uuid,
        #[serde(default)]
        task_id: Option<TaskId>,
        event_cursor: u64,
    },
    #[serde(rename = "escalation.created")]
    EscalationCreated {
        escalation_id: Uuid,
        task_id: TaskId,
        severity: Severity,
        reason: String,
    },
    #[serde(rename = "escalation.critical")]
    EscalationCritical {
        escalation_id: Uuid,
        task_id: TaskId,
        reason: String,
    },
    #[serde(rename = "escalation.resolved")]
    EscalationResolved {
        escalation_id: Uuid,
        task_id: TaskId,
        resolution: String,
    },
    #[serde(rename = "sprint.completed")]
    SprintCompleted { sprint_id: String },
    #[serde(rename = "sprint.stalled")]
    SprintStalled {
        sprint_id: String,
        incomplete: Vec<TaskId>,
    },
    #[serde(rename = "notification.test")]
    NotificationTest { hook_id: String },
}

impl Event {
    /// Every event type the log understands.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "agent.registered",
        "agent.heartbeat",
        "agent.deregistered",
        "agent.stale",
        "task.created",
        "task.offered",
        "task.claimed",
        "task.released",
        "task.started",
        "task.progress",
        "task.verified",
        "task.completed",
        "task.blocked",
        "checkpoint.created",
        "escalation.created",
        "escalation.critical",
        "escalation.resolved",
        "sprint.completed",
        "sprint.stalled",
        "notification.test",
    ];

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::AgentRegistered { .. } => "agent.registered",
            Event::AgentHeartbeat { .. } => "agent.heartbeat",
            Event::AgentDeregistered { .. } => "agent.deregistered",
            Event::AgentStale { .. } => "agent.stale",
            Event::TaskCreated { .. } => "task.created",
            Event::TaskOffered { .. } => "task.offered",
            Event::TaskClaimed { .. } => "task.claimed",
            Event::TaskReleased { .. } => "task.released",
            Event::TaskStarted { .. } => "task.started",
            Event::TaskProgress { .. } => "task.progress",
            Event::TaskVerified { .. } => "task.verified",
            Event::TaskCompleted { .. } => "task.completed",
            Event::TaskBlocked { .. } => "task.blocked",
            Event::CheckpointCreated { .. } => "checkpoint.created",
            Event::EscalationCreated { .. } => "escalation.created",
            Event::EscalationCritical { .. } => "escalation.critical",
            Event::EscalationResolved { .. } => "escalation.resolved",
            Event::SprintCompleted { .. } => "sprint.completed",
            Event::SprintStalled { .. } => "sprint.stalled",
            Event::NotificationTest { .. } => "notification.test",
        }
    }

    /// The task a `task.*` event refers to.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::TaskCreated { task } => Some(&task.id),
            Event::TaskOffered { task_id, .. }
            | Event::TaskClaimed { task_id, .. }
            | Event::TaskReleased { task_id, .. }
            | Event::TaskStarted { task_id, .. }
            | Event::TaskProgress { task_id, .. }
            | Event::TaskVerified { task_id, .. }
            | Event::TaskCompleted { task_id, .. }
            | Event::TaskBlocked { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    pub fn to_raw(&self) -> Result<RawEvent, CoordError> {
        let mut value = serde_json::to_value(self)?;
        let payload = value
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok(RawEvent {
            event_type: self.event_type().to_string(),
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// RawEvent
// ---------------------------------------------------------------------------

/// Untyped wire form of an event, as received from external reporters and
/// as preserved inside dead-letter entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Parse into a typed [`Event`]. Unknown types and mismatched payloads
    /// are rejected, never coerced.
    pub fn parse(&self) -> Result<Event, CoordError> {
        if !Event::KNOWN_TYPES.contains(&self.event_type.as_str()) {
            return Err(Precondition::Invalid(format!(
                "unknown event type `{}`",
                self.event_type
            ))
            .into());
        }
        let envelope = serde_json::json!({
            "type": self.event_type,
            "payload": self.payload,
        });
        serde_json::from_value(envelope).map_err(|e| {
            Precondition::Invalid(format!("malformed `{}` payload: {e}", self.event_type)).into()
        })
    }
}

// ---------------------------------------------------------------------------
// EventRecord
// ---------------------------------------------------------------------------

/// An event as persisted in the log, with its cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub cursor: u64,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}
