use anyhow::Context;
use cv_core::task_store::TaskFilter;
use cv_core::types::NewTask;
use serde_json::json;

use super::Ctx;
use crate::TaskCommand;

pub async fn run(ctx: &Ctx, cmd: TaskCommand) -> anyhow::Result<u8> {
    let tasks = ctx.tasks();
    match cmd {
        TaskCommand::Import { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let defs: Vec<NewTask> = serde_json::from_str(&text)
                .with_context(|| format!("{} is not a JSON array of tasks", file.display()))?;
            let summary = tasks.import(defs).await?;
            ctx.emit(&summary, || {
                format!(
                    "imported {} task(s), skipped {} existing",
                    summary.created.len(),
                    summary.skipped.len()
                )
            })?;
        }
        TaskCommand::List {
            epic,
            status,
            owner,
        } => {
            let list = tasks
                .list(TaskFilter {
                    sprint_id: epic,
                    status,
                    claimed_by: owner,
                })
                .await?;
            ctx.emit(&list, || {
                list.iter()
                    .map(|t| {
                        let owner = t
                            .claimed_by
                            .map(|a| super::short(&a))
                            .unwrap_or_else(|| "-".into());
                        format!("{:<16} {:<8} {:<12} {:<8} {}", t.id, t.sprint_id, t.status, owner, t.title)
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        TaskCommand::Show { id } => {
            let task = tasks.get(&id).await?;
            let verifications = tasks.verify(&id).await?;
            let pending = tasks.pending_dependencies(&task).await?;
            ctx.emit(
                &json!({ "task": task, "verifications": verifications, "pending_dependencies": pending }),
                || {
                    let mut out = vec![
                        format!("{} [{}] {}", task.id, task.status, task.title),
                        format!("  epic:         {}", task.sprint_id),
                    ];
                    if let Some(owner) = task.claimed_by {
                        out.push(format!("  owner:        {owner}"));
                    }
                    if let Some(reason) = &task.block_reason {
                        out.push(format!("  blocked:      {reason}"));
                    }
                    if !pending.is_empty() {
                        out.push(format!("  waiting on:   {}", pending.join(", ")));
                    }
                    for v in &verifications {
                        let mark = if v.passed { "pass" } else { "FAIL" };
                        out.push(format!("  [{mark}] {} ({})", v.criterion, v.detail));
                    }
                    out.join("\n")
                },
            )?;
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_ctx;

    #[tokio::test]
    async fn import_skips_existing_ids() {
        let ctx = test_ctx().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tasks.json");
        std::fs::write(
            &file,
            r#"[
                {"id": "T1", "sprint_id": "E1", "title": "schema"},
                {"id": "T2", "sprint_id": "E1", "dependencies": ["T1"], "required_capabilities": ["go"]}
            ]"#,
        )
        .unwrap();

        run(&ctx, TaskCommand::Import { file: file.clone() }).await.unwrap();
        run(&ctx, TaskCommand::Import { file }).await.unwrap();

        let all = ctx.tasks().list(TaskFilter::sprint("E1")).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[1].dependencies.contains("T1"));
        run(&ctx, TaskCommand::Show { id: "T2".into() }).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_import_fails_with_context() {
        let ctx = test_ctx().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tasks.json");
        std::fs::write(&file, "{not json").unwrap();
        let err = run(&ctx, TaskCommand::Import { file }).await.unwrap_err();
        assert!(err.to_string().contains("not a JSON array"));
    }
}
