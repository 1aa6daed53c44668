use serde_json::json;

use super::Ctx;
use crate::VerifyArgs;

/// Exits 1 while any acceptance criterion is unmet.
pub async fn run(ctx: &Ctx, args: VerifyArgs) -> anyhow::Result<u8> {
    let tasks = ctx.tasks();
    if let Some(criterion) = &args.record {
        tasks
            .record_verification(&args.task, criterion, !args.fail, &args.detail)
            .await?;
    }

    let results = tasks.verify(&args.task).await?;
    let passed = results.iter().all(|r| r.passed);
    ctx.emit(&json!({ "task_id": args.task, "passed": passed, "results": results }), || {
        let mut lines: Vec<String> = results
            .iter()
            .map(|r| {
                let mark = if r.passed { "pass" } else { "FAIL" };
                format!("[{mark}] {} ({})", r.criterion, r.detail)
            })
            .collect();
        if results.is_empty() {
            lines.push(format!("{} has no acceptance criteria", args.task));
        }
        lines.join("\n")
    })?;
    Ok(if passed { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_ctx;
    use cv_core::types::NewTask;

    fn args(record: Option<&str>, fail: bool) -> VerifyArgs {
        VerifyArgs {
            task: "T1".into(),
            record: record.map(str::to_string),
            fail,
            detail: String::new(),
        }
    }

    #[tokio::test]
    async fn exit_code_follows_criteria() {
        let ctx = test_ctx().await;
        ctx.tasks()
            .create(NewTask::new("T1", "E1").with_criteria(["tests pass", "lint clean"]))
            .await
            .unwrap();

        assert_eq!(run(&ctx, args(None, false)).await.unwrap(), 1);
        assert_eq!(run(&ctx, args(Some("tests pass"), false)).await.unwrap(), 1);
        assert_eq!(run(&ctx, args(Some("lint clean"), false)).await.unwrap(), 0);
        assert_eq!(run(&ctx, args(Some("lint clean"), true)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_criterion_is_rejected() {
        let ctx = test_ctx().await;
        ctx.tasks()
            .create(NewTask::new("T1", "E1").with_criteria(["tests pass"]))
            .await
            .unwrap();
        assert!(run(&ctx, args(Some("docs"), false)).await.is_err());
    }
}
