use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cv_daemon::orchestrator::{
    AssignmentMode, Orchestrator, OrchestratorOptions, ResumeFrom, RunOutcome,
};
use cv_harness::shutdown::{ShutdownSignal, StopReason};
use cv_telemetry::tracing_setup::operation_span;
use tracing::{info, Instrument};
use uuid::Uuid;

use super::{short, Ctx};
use crate::OrchestrateArgs;

/// Parse the `--resume` value: `latest` or a checkpoint id.
fn resume_from(value: &str) -> anyhow::Result<ResumeFrom> {
    if value.eq_ignore_ascii_case("latest") {
        return Ok(ResumeFrom::Latest);
    }
    let id = Uuid::parse_str(value)
        .with_context(|| format!("--resume expects `latest` or a checkpoint id, got `{value}`"))?;
    Ok(ResumeFrom::Checkpoint(id))
}

fn options(ctx: &Ctx, args: &OrchestrateArgs) -> anyhow::Result<OrchestratorOptions> {
    let mut options = OrchestratorOptions::from_config(&ctx.config.orchestrator, &args.epic);
    if let Some(secs) = args.max_runtime {
        options.max_runtime = Some(Duration::from_secs(secs));
    }
    if args.direct {
        options.mode = AssignmentMode::Direct;
    }
    options.resume = args.resume.as_deref().map(resume_from).transpose()?;
    Ok(options)
}

pub async fn run(ctx: &Ctx, args: OrchestrateArgs) -> anyhow::Result<u8> {
    let orchestrator = Orchestrator::new(
        Arc::clone(&ctx.db),
        ctx.config.orchestrator.stale_threshold(),
        options(ctx, &args)?,
        ShutdownSignal::new(),
    );

    if args.dry_run {
        let rows = orchestrator.dry_run().await?;
        ctx.emit(&rows, || {
            rows.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n")
        })?;
        return Ok(0);
    }

    // ctrl-c saves a checkpoint rather than abandoning the run.
    let stop = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, checkpointing run");
            stop.trigger(StopReason::Checkpoint);
        }
    });

    let (span, trace_id) = operation_span("orchestrate");
    info!(%trace_id, epic = %args.epic, "orchestrator run starting");
    let report = orchestrator.run().instrument(span).await?;
    ctx.emit(&report, || match &report.outcome {
        RunOutcome::Completed => format!(
            "epic {} complete after {} cycle(s), {} assignment(s)",
            report.sprint_id, report.cycles, report.assignments
        ),
        RunOutcome::Stalled { incomplete } => format!(
            "epic {} stalled; incomplete: {}",
            report.sprint_id,
            incomplete.join(", ")
        ),
        RunOutcome::CheckpointSaved {
            checkpoint_id,
            event_cursor,
        } => format!(
            "checkpoint {} saved at event {event_cursor}; rerun with --resume {checkpoint_id}",
            short(checkpoint_id)
        ),
    })?;
    Ok(u8::try_from(report.outcome.exit_code()).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_ctx;
    use cv_core::types::NewTask;

    fn args(epic: &str) -> OrchestrateArgs {
        OrchestrateArgs {
            epic: epic.into(),
            dry_run: false,
            resume: None,
            max_runtime: None,
            direct: false,
        }
    }

    #[test]
    fn resume_value_parsing() {
        assert_eq!(resume_from("latest").unwrap(), ResumeFrom::Latest);
        let id = Uuid::new_v4();
        assert_eq!(
            resume_from(&id.to_string()).unwrap(),
            ResumeFrom::Checkpoint(id)
        );
        assert!(resume_from("yesterday").is_err());
    }

    #[tokio::test]
    async fn flags_override_config() {
        let ctx = test_ctx().await;
        let mut a = args("E1");
        a.max_runtime = Some(5);
        a.direct = true;
        a.resume = Some("latest".into());
        let opts = options(&ctx, &a).unwrap();
        assert_eq!(opts.max_runtime, Some(Duration::from_secs(5)));
        assert_eq!(opts.mode, AssignmentMode::Direct);
        assert_eq!(opts.resume, Some(ResumeFrom::Latest));
    }

    #[tokio::test]
    async fn completed_epic_exits_zero() {
        let ctx = test_ctx().await;
        let agent = ctx
            .registry()
            .register("w", Default::default())
            .await
            .unwrap();
        ctx.tasks().create(NewTask::new("T1", "E1")).await.unwrap();
        ctx.tasks().claim("T1", agent.id).await.unwrap();
        ctx.tasks().complete("T1", agent.id).await.unwrap();

        assert_eq!(run(&ctx, args("E1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dry_run_leaves_tasks_untouched() {
        let ctx = test_ctx().await;
        ctx.registry()
            .register("w", Default::default())
            .await
            .unwrap();
        ctx.tasks().create(NewTask::new("T1", "E1")).await.unwrap();
        let head = ctx.events().head().await.unwrap();

        let mut a = args("E1");
        a.dry_run = true;
        assert_eq!(run(&ctx, a).await.unwrap(), 0);
        assert_eq!(ctx.events().head().await.unwrap(), head);
    }
}
