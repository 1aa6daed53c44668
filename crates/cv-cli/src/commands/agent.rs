use std::sync::Arc;
use std::time::Duration;

use cv_agents::executor::ShellExecutor;
use cv_agents::registry::AgentFilter;
use cv_agents::worker::{WorkerAgent, WorkerConfig, WorkerMode};
use cv_core::task_store::TaskFilter;
use cv_harness::shutdown::ShutdownSignal;
use serde_json::json;
use cv_telemetry::tracing_setup::operation_span;
use tracing::{info, Instrument};

use super::{short, Ctx};
use crate::{AgentCommand, WorkArgs};

pub async fn run(ctx: &Ctx, cmd: AgentCommand) -> anyhow::Result<u8> {
    let registry = ctx.registry();
    match cmd {
        AgentCommand::Register { name, capabilities } => {
            let agent = registry
                .register(&name, capabilities.into_iter().collect())
                .await?;
            ctx.emit(&agent, || format!("registered {} as {}", agent.name, agent.id))?;
        }
        AgentCommand::List { status, capability } => {
            let agents = registry.list(AgentFilter { status, capability }).await?;
            ctx.emit(&agents, || {
                agents
                    .iter()
                    .map(|a| {
                        let caps: Vec<&str> = a.capabilities.iter().map(String::as_str).collect();
                        format!(
                            "{}  {:<20} {:<7} [{}]",
                            short(&a.id),
                            a.name,
                            a.status,
                            caps.join(",")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        AgentCommand::Status { id } => {
            let agent = registry.get(id).await?;
            let held = ctx
                .tasks()
                .list(TaskFilter {
                    claimed_by: Some(id),
                    ..TaskFilter::default()
                })
                .await?;
            let held_ids: Vec<&str> = held.iter().map(|t| t.id.as_str()).collect();
            ctx.emit(&json!({ "agent": agent, "tasks": held }), || {
                format!(
                    "{} ({}) {} last heartbeat {} holding [{}]",
                    agent.name,
                    agent.id,
                    agent.status,
                    agent.last_heartbeat.to_rfc3339(),
                    held_ids.join(", ")
                )
            })?;
        }
        AgentCommand::Deregister { id } => {
            let released = registry.deregister(id).await?;
            ctx.emit(&json!({ "agent_id": id, "released": released }), || {
                format!("deregistered {id}, released {} task(s)", released.len())
            })?;
        }
        AgentCommand::Work(args) => return work(ctx, args).await,
    }
    Ok(0)
}

/// Run a worker until ctrl-c or the idle limit.
async fn work(ctx: &Ctx, args: WorkArgs) -> anyhow::Result<u8> {
    let mut config = WorkerConfig::new(args.name, args.capabilities);
    config.mode = if args.peer_swarm {
        WorkerMode::PeerSwarm
    } else {
        WorkerMode::Supervised
    };
    config.poll_interval = ctx.config.orchestrator.poll_interval();
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_secs.max(1));
    config.sprint_id = args.epic;
    config.max_idle_polls = args.max_idle_polls;

    let executor = ShellExecutor::new(args.command, Duration::from_secs(args.timeout_secs));
    let shutdown = ShutdownSignal::new();
    let worker = WorkerAgent::new(
        config,
        ctx.registry(),
        ctx.tasks(),
        ctx.escalations(),
        ctx.events(),
        Arc::new(executor),
        shutdown.clone(),
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, stopping worker");
            shutdown.shutdown();
        }
    });

    let (span, _) = operation_span("worker");
    let report = worker.run().instrument(span).await?;
    ctx.emit(&report, || {
        format!(
            "worker done: {} completed, {} blocked, {} released",
            report.completed.len(),
            report.blocked.len(),
            report.released.len()
        )
    })?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_ctx;
    use cv_core::types::{AgentStatus, NewTask};
    use uuid::Uuid;

    #[tokio::test]
    async fn register_then_deregister_releases_tasks() {
        let ctx = test_ctx().await;
        let code = run(
            &ctx,
            AgentCommand::Register {
                name: "w1".into(),
                capabilities: vec!["go".into()],
            },
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let agent = ctx
            .registry()
            .list(AgentFilter::default())
            .await
            .unwrap()
            .remove(0);
        assert_eq!(agent.status, AgentStatus::Active);
        assert!(agent.capabilities.contains("go"));

        ctx.tasks().create(NewTask::new("T1", "E1")).await.unwrap();
        ctx.tasks().claim("T1", agent.id).await.unwrap();
        run(&ctx, AgentCommand::Status { id: agent.id }).await.unwrap();
        run(&ctx, AgentCommand::Deregister { id: agent.id }).await.unwrap();
        assert!(ctx.tasks().get("T1").await.unwrap().claimed_by.is_none());
    }

    #[tokio::test]
    async fn unknown_agent_is_an_error() {
        let ctx = test_ctx().await;
        let err = run(&ctx, AgentCommand::Status { id: Uuid::new_v4() })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<cv_core::error::CoordError>().is_some());
    }
}
