use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use cv_core::types::{Task, VerificationResult};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

/// Bytes of stderr kept in a failure reason.
const STDERR_TAIL: usize = 2048;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Work done; `results` are recorded before completing.
    Succeeded { results: Vec<VerificationResult> },
    /// Work attempted and failed; the task is blocked and escalated.
    Failed { reason: String },
    /// The agent could not attempt the work; the task is released.
    GaveUp { reason: String },
}

/// Performs the work behind a claimed task.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> ExecutionOutcome;
}

// ---------------------------------------------------------------------------
// ShellExecutor
// ---------------------------------------------------------------------------

/// Runs one shell command per task.
///
/// The task is exposed to the command through `CONVOY_TASK_ID`,
/// `CONVOY_SPRINT_ID`, `CONVOY_TASK_TITLE` and `CONVOY_CRITERIA`
/// (newline-separated). Exit status 0 passes every acceptance criterion.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    command: String,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn build_command(&self, task: &Task) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .env("CONVOY_TASK_ID", &task.id)
            .env("CONVOY_SPRINT_ID", &task.sprint_id)
            .env("CONVOY_TASK_TITLE", &task.title)
            .env("CONVOY_CRITERIA", task.acceptance_criteria.join("\n"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        debug!(task_id = %task.id, command = %self.command, "running task command");
        let child = match self.build_command(task).spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::GaveUp {
                    reason: format!("failed to spawn `{}`: {e}", self.command),
                }
            }
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => ExecutionOutcome::Succeeded {
                results: task
                    .acceptance_criteria
                    .iter()
                    .map(|criterion| VerificationResult {
                        criterion: criterion.clone(),
                        passed: true,
                        detail: "command exited 0".into(),
                    })
                    .collect(),
            },
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let code = output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                warn!(task_id = %task.id, exit = %code, "task command failed");
                ExecutionOutcome::Failed {
                    reason: format!("exit {code}: {}", tail(stderr.trim_end(), STDERR_TAIL)),
                }
            }
            Ok(Err(e)) => ExecutionOutcome::GaveUp {
                reason: format!("task command i/o error: {e}"),
            },
            Err(_) => {
                warn!(task_id = %task.id, timeout_secs = self.timeout.as_secs(), "task command timed out");
                ExecutionOutcome::Failed {
                    reason: format!("timed out after {}s", self.timeout.as_secs()),
                }
            }
        }
    }
}

/// The last `max` bytes of `s`, cut at a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("aé", 1), "");
    }
}
