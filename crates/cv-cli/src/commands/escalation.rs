use cv_agents::escalation::EscalationFilter;

use super::{short, Ctx};
use crate::EscalationCommand;

pub async fn run(ctx: &Ctx, cmd: EscalationCommand) -> anyhow::Result<u8> {
    let escalations = ctx.escalations();
    match cmd {
        EscalationCommand::Create {
            task,
            reason,
            severity,
        } => {
            let esc = escalations.create(&task, &reason, severity).await?;
            ctx.emit(&esc, || format!("escalation {} opened for {}", esc.id, esc.task_id))?;
        }
        EscalationCommand::List {
            status,
            severity,
            task,
        } => {
            let list = escalations
                .list(EscalationFilter {
                    status,
                    severity,
                    task_id: task,
                })
                .await?;
            ctx.emit(&list, || {
                list.iter()
                    .map(|e| {
                        format!(
                            "{}  {:<8} {:<9} {:<16} {}",
                            short(&e.id),
                            e.severity,
                            e.status,
                            e.task_id,
                            e.reason
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        EscalationCommand::Resolve { id, resolution } => {
            let esc = escalations.resolve(id, &resolution).await?;
            ctx.emit(&esc, || format!("escalation {} resolved", esc.id))?;
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_ctx;
    use cv_core::types::{EscalationStatus, NewTask, Severity};

    #[tokio::test]
    async fn create_list_resolve() {
        let ctx = test_ctx().await;
        ctx.tasks().create(NewTask::new("T1", "E1")).await.unwrap();
        run(
            &ctx,
            EscalationCommand::Create {
                task: "T1".into(),
                reason: "needs credentials".into(),
                severity: Severity::High,
            },
        )
        .await
        .unwrap();

        let open = ctx.escalations().list(EscalationFilter::open()).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].severity, Severity::High);

        run(
            &ctx,
            EscalationCommand::Resolve {
                id: open[0].id,
                resolution: "added secret".into(),
            },
        )
        .await
        .unwrap();
        let esc = ctx.escalations().get(open[0].id).await.unwrap();
        assert_eq!(esc.status, EscalationStatus::Resolved);
        assert_eq!(esc.resolution.as_deref(), Some("added secret"));
    }
}
