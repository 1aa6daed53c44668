use cv_agents::consumer::StoreApplier;
use cv_core::dlq::{DlqFilter, RetryOutcome, RetryReport};
use cv_core::types::DlqEntry;
use serde_json::json;

use super::{short, Ctx};
use crate::DlqCommand;

fn applier(ctx: &Ctx) -> StoreApplier {
    StoreApplier::new(ctx.tasks(), ctx.registry(), ctx.escalations())
}

fn entry_line(e: &DlqEntry) -> String {
    format!(
        "{}  {:<9} {:<20} retries={} {}",
        short(&e.id),
        e.status,
        e.original_event.event_type,
        e.retry_count,
        e.failure_reason
    )
}

fn report_line(r: &RetryReport) -> String {
    let outcome = match &r.outcome {
        RetryOutcome::Resolved => "resolved".to_string(),
        RetryOutcome::Failed { reason } => format!("failed: {reason}"),
        RetryOutcome::Exhausted { reason } => format!("abandoned: {reason}"),
        RetryOutcome::Skipped { reason } => format!("skipped: {reason}"),
    };
    format!("{}  {:<20} {outcome}", short(&r.id), r.event_type)
}

pub async fn run(ctx: &Ctx, cmd: DlqCommand) -> anyhow::Result<u8> {
    let dlq = ctx.dlq();
    match cmd {
        DlqCommand::List { status, event_type } => {
            let entries = dlq.list(DlqFilter { status, event_type }).await?;
            ctx.emit(&entries, || {
                entries.iter().map(entry_line).collect::<Vec<_>>().join("\n")
            })?;
        }
        DlqCommand::Show { id } => {
            let entry = dlq.get(id).await?;
            ctx.emit(&entry, || {
                format!(
                    "{}\n  payload: {}",
                    entry_line(&entry),
                    entry.original_event.payload
                )
            })?;
        }
        DlqCommand::Retry { id } => {
            let report = dlq.retry(id, &applier(ctx)).await?;
            ctx.emit(&report, || report_line(&report))?;
            if !matches!(report.outcome, RetryOutcome::Resolved) {
                return Ok(1);
            }
        }
        DlqCommand::RetryAll { event_type } => {
            let reports = dlq
                .retry_all(
                    DlqFilter {
                        status: None,
                        event_type,
                    },
                    &applier(ctx),
                )
                .await?;
            ctx.emit(&reports, || {
                reports.iter().map(report_line).collect::<Vec<_>>().join("\n")
            })?;
        }
        DlqCommand::Stats => {
            let stats = dlq.stats().await?;
            ctx.emit(&stats, || {
                let oldest = stats
                    .oldest_pending
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                format!(
                    "pending {}  resolved {}  abandoned {}  oldest pending {oldest}",
                    stats.pending, stats.resolved, stats.abandoned
                )
            })?;
        }
        DlqCommand::Cleanup { older_than_days } => {
            let days = older_than_days.unwrap_or(ctx.config.dlq.retention_days);
            let abandoned = dlq.cleanup(days).await?;
            ctx.emit(&json!({ "abandoned": abandoned, "older_than_days": days }), || {
                format!("abandoned {abandoned} pending entries older than {days} day(s)")
            })?;
        }
    }
    Ok(0)
}
