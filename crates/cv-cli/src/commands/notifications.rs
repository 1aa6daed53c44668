use std::sync::Arc;

use anyhow::Context;
use cv_bridge::notifications::{DeliveryRecord, NotificationDispatcher, ReqwestTransport};
use cv_harness::retry::RetryPolicy;

use super::Ctx;
use crate::NotificationsCommand;

/// A test send is one attempt so the result reflects the hook right now.
fn dispatcher(ctx: &Ctx) -> anyhow::Result<NotificationDispatcher> {
    let transport = ReqwestTransport::new().context("failed to build HTTP client")?;
    Ok(NotificationDispatcher::new(
        Arc::clone(&ctx.db),
        ctx.config.notifications.hooks.clone(),
        Arc::new(transport),
        RetryPolicy::once(),
    ))
}

fn delivery_line(d: &DeliveryRecord) -> String {
    let result = match (d.success, d.status_code, &d.error) {
        (true, Some(code), _) => format!("ok {code}"),
        (true, None, _) => "ok".to_string(),
        (false, Some(code), _) => format!("failed {code}"),
        (false, None, Some(err)) => format!("failed: {err}"),
        (false, None, None) => "failed".to_string(),
    };
    format!(
        "{}  {:<16} {:<20} #{} {result}",
        d.attempted_at.format("%Y-%m-%d %H:%M:%S"),
        d.hook_id,
        d.event_type,
        d.attempt
    )
}

pub async fn run(ctx: &Ctx, cmd: NotificationsCommand) -> anyhow::Result<u8> {
    let dispatcher = dispatcher(ctx)?;
    match cmd {
        NotificationsCommand::List => {
            let hooks = dispatcher.hooks();
            ctx.emit(&hooks, || {
                hooks
                    .iter()
                    .map(|h| {
                        format!(
                            "{:<16} {:<8} {} [{}]",
                            h.id,
                            h.kind,
                            h.url,
                            h.event_filter.join(",")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        NotificationsCommand::Test { hook } => {
            let record = dispatcher.test(&hook).await?;
            ctx.emit(&record, || delivery_line(&record))?;
            if !record.success {
                return Ok(1);
            }
        }
        NotificationsCommand::History { limit } => {
            let history = dispatcher.history(limit).await?;
            ctx.emit(&history, || {
                history.iter().map(delivery_line).collect::<Vec<_>>().join("\n")
            })?;
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_ctx;
    use cv_core::types::{HookKind, NotificationHook};

    #[tokio::test]
    async fn failed_test_send_is_recorded() {
        let mut ctx = test_ctx().await;
        ctx.config.notifications.hooks = vec![NotificationHook {
            id: "ops".into(),
            kind: HookKind::Webhook,
            // Nothing listens on port 1.
            url: "http://127.0.0.1:1/hook".into(),
            event_filter: vec!["*".into()],
        }];

        let code = run(&ctx, NotificationsCommand::Test { hook: "ops".into() })
            .await
            .unwrap();
        assert_eq!(code, 1);

        let history = dispatcher(&ctx).unwrap().history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].event_type, "notification.test");
    }

    #[tokio::test]
    async fn unknown_hook_is_not_found() {
        let ctx = test_ctx().await;
        let err = run(&ctx, NotificationsCommand::Test { hook: "nope".into() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
