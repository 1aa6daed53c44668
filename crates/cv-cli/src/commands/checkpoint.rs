use cv_core::checkpoint::CheckpointFilter;
use cv_core::types::{Checkpoint, NewCheckpoint};
use serde_json::json;

use super::{short, Ctx};
use crate::CheckpointCommand;

fn line(cp: &Checkpoint) -> String {
    let scope = match (&cp.task_id, &cp.sprint_id) {
        (Some(task), _) => format!("task {task}"),
        (None, Some(epic)) => format!("epic {epic}"),
        (None, None) => "-".to_string(),
    };
    format!(
        "{}  {}  {:<16} @{:<6} {}",
        short(&cp.id),
        cp.created_at.format("%Y-%m-%d %H:%M:%S"),
        scope,
        cp.event_cursor,
        cp.message
    )
}

pub async fn run(ctx: &Ctx, cmd: CheckpointCommand) -> anyhow::Result<u8> {
    let checkpoints = ctx.checkpoints();
    match cmd {
        CheckpointCommand::Create {
            task,
            epic,
            commit,
            files,
            message,
        } => {
            let cp = checkpoints
                .create(NewCheckpoint {
                    task_id: task,
                    sprint_id: epic,
                    commit_ref: commit,
                    modified_files: files,
                    message,
                })
                .await?;
            ctx.emit(&cp, || format!("checkpoint {} at event {}", cp.id, cp.event_cursor))?;
        }
        CheckpointCommand::List { task, epic } => {
            let list = checkpoints
                .list(CheckpointFilter {
                    task_id: task,
                    sprint_id: epic,
                    orchestrator_only: false,
                })
                .await?;
            ctx.emit(&list, || list.iter().map(line).collect::<Vec<_>>().join("\n"))?;
        }
        CheckpointCommand::Show { id } => {
            let cp = checkpoints.get(id).await?;
            ctx.emit(&cp, || {
                let mut out = vec![line(&cp)];
                if !cp.commit_ref.is_empty() {
                    out.push(format!("  commit: {}", cp.commit_ref));
                }
                for file in &cp.modified_files {
                    out.push(format!("  M {file}"));
                }
                out.join("\n")
            })?;
        }
        CheckpointCommand::Prune { older_than_days } => {
            let removed = checkpoints.prune(older_than_days).await?;
            ctx.emit(&json!({ "removed": removed }), || {
                format!("removed {removed} checkpoint(s)")
            })?;
        }
    }
    Ok(0)
}
