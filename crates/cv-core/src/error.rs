//! Coordination error taxonomy.
//!
//! Every store and coordination operation returns [`CoordError`]. Callers
//! branch on the variant: `Conflict` and `NotFound` are recovered locally by
//! control loops, `CyclicDependency` and `Fatal` abort an orchestrator run,
//! and `Transient` is eligible for caller-side retry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Coarse classification of a [`CoordError`], surfaced in verbose CLI output
/// and in HTTP error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Conflict,
    NotFound,
    Precondition,
    CyclicDependency,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Precondition => "precondition",
            ErrorKind::CyclicDependency => "cyclic_dependency",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Precondition
// ---------------------------------------------------------------------------

/// A violated precondition on an otherwise well-formed request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Precondition {
    #[error("an active agent already holds the name `{0}`")]
    DuplicateName(String),
    #[error("{entity} `{id}` already exists")]
    AlreadyExists { entity: &'static str, id: String },
    #[error("task `{task_id}` is not owned by agent {agent_id}")]
    NotOwner { task_id: String, agent_id: String },
    #[error("task `{task_id}` cannot go from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },
    #[error("acceptance criteria not met for `{task_id}`: {unmet:?}")]
    AcceptanceNotMet { task_id: String, unmet: Vec<String> },
    #[error("`{criterion}` is not an acceptance criterion of `{task_id}`")]
    UnknownCriterion { task_id: String, criterion: String },
    #[error("escalation {0} is already resolved")]
    AlreadyResolved(String),
    #[error("agent {agent_id} lacks capabilities {missing:?} required by `{task_id}`")]
    CapabilityMismatch {
        task_id: String,
        agent_id: String,
        missing: Vec<String>,
    },
    #[error("agent {0} is not active")]
    AgentNotActive(String),
    #[error("task `{task_id}` has incomplete dependencies {pending:?}")]
    DependenciesIncomplete {
        task_id: String,
        pending: Vec<String>,
    },
    #[error("event `{0}` cannot be applied to materialized state")]
    NotApplicable(String),
    #[error("{0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// CoordError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CoordError {
    /// Another caller won the compare-and-set. Expected under contention.
    #[error("conflict: task `{task_id}` is {status}")]
    Conflict { task_id: String, status: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("precondition failed: {0}")]
    Precondition(#[from] Precondition),

    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoordError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoordError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordError::Conflict { .. } => ErrorKind::Conflict,
            CoordError::NotFound { .. } => ErrorKind::NotFound,
            CoordError::Precondition(_) => ErrorKind::Precondition,
            CoordError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            CoordError::Transient(_) => ErrorKind::Transient,
            CoordError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CoordError::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CoordError::Conflict { .. })
    }
}

impl From<rusqlite::Error> for CoordError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                CoordError::Transient(err.to_string())
            }
            _ => CoordError::Fatal(format!("store: {err}")),
        }
    }
}

impl From<tokio_rusqlite::Error> for CoordError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(inner) => inner.into(),
            tokio_rusqlite::Error::ConnectionClosed => {
                CoordError::Fatal("store connection closed".into())
            }
            other => CoordError::Fatal(format!("store: {other}")),
        }
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        CoordError::Fatal(format!("corrupt record: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;
