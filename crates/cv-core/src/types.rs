use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::RawEvent;

/// Tasks are identified by caller-chosen strings (decomposition is external).
pub type TaskId = String;

/// Agents are identified by a UUID issued at registration.
pub type AgentId = Uuid;

/// Parse a snake_case enum value through its serde representation.
pub(crate) fn parse_enum<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| format!("unrecognised value `{raw}`"))
}

macro_rules! str_enum {
    ($ty:ty { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_enum(s)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

/// `Active` agents accept assignments; `Idle` agents are live but not
/// accepting new work. `Stale` is never stored: it is derived from the last
/// heartbeat and the configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Stale,
}

str_enum!(AgentStatus {
    Active => "active",
    Idle => "idle",
    Stale => "stale",
});

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Last time the orchestrator offered or assigned work to this agent.
    pub last_assigned_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(name: impl Into<String>, capabilities: impl IntoIterator<Item = String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
            status: AgentStatus::Active,
            last_heartbeat: now,
            registered_at: now,
            last_assigned_at: None,
        }
    }

    /// True when `now - last_heartbeat` exceeds `threshold`.
    pub fn is_stale_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let elapsed = now
            .signed_duration_since(self.last_heartbeat)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed > threshold
    }

    /// The status a reader should see, with staleness folded in.
    pub fn effective_status(&self, now: DateTime<Utc>, threshold: Duration) -> AgentStatus {
        if self.is_stale_at(now, threshold) {
            AgentStatus::Stale
        } else {
            self.status
        }
    }

    /// Required capabilities this agent does not have, in sorted order.
    pub fn missing_capabilities(&self, required: &BTreeSet<String>) -> Vec<String> {
        required.difference(&self.capabilities).cloned().collect()
    }

    pub fn can_perform(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Claimed,
    InProgress,
    Blocked,
    Complete,
}

str_enum!(TaskStatus {
    Todo => "todo",
    Claimed => "claimed",
    InProgress => "in_progress",
    Blocked => "blocked",
    Complete => "complete",
});

impl TaskStatus {
    /// Statuses in which `claimed_by` must be set.
    pub fn has_owner(&self) -> bool {
        matches!(
            self,
            TaskStatus::Claimed | TaskStatus::InProgress | TaskStatus::Blocked
        )
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub sprint_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub dependencies: BTreeSet<TaskId>,
    pub claimed_by: Option<AgentId>,
    pub completed_by: Option<AgentId>,
    pub required_capabilities: BTreeSet<String>,
    pub acceptance_criteria: Vec<String>,
    pub block_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_complete(&self) -> bool {
        self.status == TaskStatus::Complete
    }
}

/// Task definition supplied by epic decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: TaskId,
    pub sprint_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl NewTask {
    pub fn new(id: impl Into<String>, sprint_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            sprint_id: sprint_id.into(),
            description: None,
            dependencies: BTreeSet::new(),
            required_capabilities: BTreeSet::new(),
            acceptance_criteria: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn requires<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(caps.into_iter().map(Into::into));
        self
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria
            .extend(criteria.into_iter().map(Into::into));
        self
    }
}

/// Outcome of one acceptance criterion as last reported by an external check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub criterion: String,
    pub passed: bool,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    /// `None` for orchestrator-level checkpoints.
    pub task_id: Option<TaskId>,
    pub sprint_id: Option<String>,
    pub commit_ref: String,
    pub modified_files: Vec<String>,
    pub event_cursor: u64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCheckpoint {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub sprint_id: Option<String>,
    #[serde(default)]
    pub commit_ref: String,
    #[serde(default)]
    pub modified_files: Vec<String>,
    #[serde(default)]
    pub message: String,
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

str_enum!(Severity {
    Critical => "critical",
    High => "high",
    Medium => "medium",
    Low => "low",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Open,
    Resolved,
}

str_enum!(EscalationStatus {
    Open => "open",
    Resolved => "resolved",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub task_id: TaskId,
    pub reason: String,
    pub severity: Severity,
    pub status: EscalationStatus,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Dead-letter queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Resolved,
    Abandoned,
}

str_enum!(DlqStatus {
    Pending => "pending",
    Resolved => "resolved",
    Abandoned => "abandoned",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub original_event: RawEvent,
    pub failure_reason: String,
    pub retry_count: u32,
    pub status: DlqStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Notification hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Slack,
    Discord,
    Teams,
    Webhook,
}

str_enum!(HookKind {
    Slack => "slack",
    Discord => "discord",
    Teams => "teams",
    Webhook => "webhook",
});

/// A statically configured notification target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationHook {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: HookKind,
    pub url: String,
    #[serde(default)]
    pub event_filter: Vec<String>,
}

impl NotificationHook {
    /// Whether this hook wants events of `event_type`.
    ///
    /// Patterns are `*`, an exact type, or a prefix ending in `.*`.
    pub fn accepts(&self, event_type: &str) -> bool {
        self.event_filter.iter().any(|pattern| {
            if pattern == "*" || pattern == event_type {
                return true;
            }
            match pattern.strip_suffix(".*") {
                Some(prefix) => event_type
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.')),
                None => false,
            }
        })
    }
}
