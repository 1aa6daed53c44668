//! Dead-letter queue for events that could not be applied.
//!
//! Entries are never deleted. A failed retry bumps `retry_count` and leaves
//! the entry pending until the count reaches `max_retries`, at which point
//! the entry is abandoned with the last error. Cleanup also moves old
//! pending entries to `abandoned`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use cv_telemetry::metrics::{global_metrics, names};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DlqConfig;
use crate::db::{sql, ts_now_minus_days, CoordDb};
use crate::error::{CoordError, Precondition, Result};
use crate::events::RawEvent;
use crate::types::{DlqEntry, DlqStatus};

const DLQ_COLUMNS: &str =
    "id, event_type, payload, failure_reason, retry_count, status, created_at, last_attempt_at";

/// Something that can (re-)apply a raw event to materialized state.
#[async_trait]
pub trait EventApplier: Send + Sync {
    async fn apply(&self, event: &RawEvent) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DlqFilter {
    #[serde(default)]
    pub status: Option<DlqStatus>,
    #[serde(default)]
    pub event_type: Option<String>,
}

impl DlqFilter {
    pub fn pending() -> Self {
        Self {
            status: Some(DlqStatus::Pending),
            event_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    Resolved,
    Failed { reason: String },
    /// Failed and used up the last retry; the entry is now abandoned.
    Exhausted { reason: String },
    /// Another writer changed the entry mid-retry; nothing was recorded.
    Skipped { reason: String },
}

impl RetryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Failed { .. } => "failed",
            Self::Exhausted { .. } => "exhausted",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Per-entry result of a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    pub id: Uuid,
    pub event_type: String,
    pub retry_count: u32,
    #[serde(flatten)]
    pub outcome: RetryOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqStats {
    pub pending: u64,
    pub resolved: u64,
    pub abandoned: u64,
    pub oldest_pending: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    db: Arc<CoordDb>,
    max_retries: u32,
}

impl DeadLetterQueue {
    pub fn new(db: Arc<CoordDb>, max_retries: u32) -> Self {
        Self { db, max_retries }
    }

    pub fn from_config(db: Arc<CoordDb>, config: &DlqConfig) -> Self {
        Self::new(db, config.max_retries)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Wrap a failed event into a pending entry.
    pub async fn capture(&self, event: RawEvent, reason: impl Into<String>) -> Result<DlqEntry> {
        let reason = reason.into();
        let entry = self
            .db
            .write(move |tx| {
                let entry = DlqEntry {
                    id: Uuid::new_v4(),
                    original_event: event,
                    failure_reason: reason,
                    retry_count: 0,
                    status: DlqStatus::Pending,
                    created_at: tx.now(),
                    last_attempt_at: None,
                };
                tx.conn().execute(
                    &format!(
                        "INSERT INTO dlq_entries ({DLQ_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, NULL)"
                    ),
                    params![
                        entry.id.to_string(),
                        entry.original_event.event_type,
                        serde_json::to_string(&entry.original_event.payload)?,
                        entry.failure_reason,
                        entry.status.as_str(),
                        sql::ts(entry.created_at),
                    ],
                )?;
                Ok(entry)
            })
            .await?;
        warn!(
            dlq_id = %entry.id,
            event_type = %entry.original_event.event_type,
            reason = %entry.failure_reason,
            "event captured in dead-letter queue"
        );
        Ok(entry)
    }

    pub async fn get(&self, id: Uuid) -> Result<DlqEntry> {
        self.db
            .read(move |conn| {
                conn.query_row(
                    &format!("SELECT {DLQ_COLUMNS} FROM dlq_entries WHERE id = ?1"),
                    params![id.to_string()],
                    row_to_entry,
                )
                .optional()?
                .ok_or_else(|| CoordError::not_found("dlq entry", id))
            })
            .await
    }

    /// Matching entries, oldest first.
    pub async fn list(&self, filter: DlqFilter) -> Result<Vec<DlqEntry>> {
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DLQ_COLUMNS} FROM dlq_entries
                     WHERE (?1 IS NULL OR status = ?1)
                       AND (?2 IS NULL OR event_type = ?2)
                     ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt.query_map(
                    params![filter.status.map(|s| s.as_str()), filter.event_type],
                    row_to_entry,
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    /// Re-apply one pending entry. A failure that uses up the retry budget
    /// moves the entry to `abandoned`.
    pub async fn retry(&self, id: Uuid, applier: &dyn EventApplier) -> Result<RetryReport> {
        let entry = self.get(id).await?;
        if entry.status != DlqStatus::Pending {
            return Err(Precondition::Invalid(format!(
                "dlq entry {id} is {}, not pending",
                entry.status
            ))
            .into());
        }
        self.attempt(entry, applier).await
    }

    /// Retry every pending entry matching `filter`. Individual failures are
    /// reported, never raised. The budget rule is the same as `retry`.
    pub async fn retry_all(
        &self,
        filter: DlqFilter,
        applier: &dyn EventApplier,
    ) -> Result<Vec<RetryReport>> {
        let filter = DlqFilter {
            status: Some(DlqStatus::Pending),
            ..filter
        };
        let entries = self.list(filter).await?;
        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = entry.id;
            let event_type = entry.original_event.event_type.clone();
            let retry_count = entry.retry_count;
            match self.attempt(entry, applier).await {
                Ok(report) => reports.push(report),
                Err(e) => reports.push(RetryReport {
                    id,
                    event_type,
                    retry_count,
                    outcome: RetryOutcome::Failed {
                        reason: e.to_string(),
                    },
                }),
            }
        }
        let resolved = reports
            .iter()
            .filter(|r| r.outcome == RetryOutcome::Resolved)
            .count();
        info!(attempted = reports.len(), resolved, "dlq batch retry finished");
        Ok(reports)
    }

    async fn attempt(&self, entry: DlqEntry, applier: &dyn EventApplier) -> Result<RetryReport> {
        let applied = applier.apply(&entry.original_event).await;
        let id = entry.id;
        let seen_count = entry.retry_count;
        let (outcome, status, retry_count, reason) = match applied {
            Ok(()) => (
                RetryOutcome::Resolved,
                DlqStatus::Resolved,
                seen_count,
                entry.failure_reason,
            ),
            Err(e) if self.exhausts_budget(seen_count + 1) => {
                let reason = format!("retry budget of {} exhausted: {e}", self.max_retries);
                let outcome = RetryOutcome::Exhausted {
                    reason: reason.clone(),
                };
                (outcome, DlqStatus::Abandoned, seen_count + 1, reason)
            }
            Err(e) => {
                let reason = e.to_string();
                let outcome = RetryOutcome::Failed {
                    reason: reason.clone(),
                };
                (outcome, DlqStatus::Pending, seen_count + 1, reason)
            }
        };

        let recorded = self
            .db
            .write(move |tx| {
                let changed = tx.conn().execute(
                    "UPDATE dlq_entries
                     SET status = ?1, retry_count = ?2, failure_reason = ?3, last_attempt_at = ?4
                     WHERE id = ?5 AND status = 'pending' AND retry_count = ?6",
                    params![
                        status.as_str(),
                        retry_count,
                        reason,
                        sql::ts(tx.now()),
                        id.to_string(),
                        seen_count,
                    ],
                )?;
                Ok(changed == 1)
            })
            .await?;

        let (outcome, retry_count) = if recorded {
            (outcome, retry_count)
        } else {
            let skipped = RetryOutcome::Skipped {
                reason: "entry changed during retry".into(),
            };
            (skipped, seen_count)
        };
        global_metrics()
            .increment_counter(names::DLQ_RETRIES_TOTAL, &[("outcome", outcome.label())]);
        info!(dlq_id = %id, retry_count, ?outcome, "dlq retry");
        Ok(RetryReport {
            id,
            event_type: entry.original_event.event_type,
            retry_count,
            outcome,
        })
    }

    /// A failed attempt that brings the count to `max_retries` abandons
    /// the entry.
    fn exhausts_budget(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Move pending entries older than the window to `abandoned`.
    pub async fn cleanup(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = ts_now_minus_days(older_than_days);
        let abandoned = self
            .db
            .write(move |tx| {
                Ok(tx.conn().execute(
                    "UPDATE dlq_entries SET status = 'abandoned'
                     WHERE status = 'pending' AND created_at < ?1",
                    params![cutoff],
                )?)
            })
            .await?;
        if abandoned > 0 {
            info!(abandoned, older_than_days, "dlq entries abandoned");
        }
        Ok(abandoned)
    }

    pub async fn stats(&self) -> Result<DlqStats> {
        self.db
            .read(|conn| {
                let mut stats = DlqStats::default();
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM dlq_entries GROUP BY status")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (status, count) = row?;
                    match sql::parse_enum::<DlqStatus>(0, &status)? {
                        DlqStatus::Pending => stats.pending = count as u64,
                        DlqStatus::Resolved => stats.resolved = count as u64,
                        DlqStatus::Abandoned => stats.abandoned = count as u64,
                    }
                }
                let oldest: Option<String> = conn.query_row(
                    "SELECT MIN(created_at) FROM dlq_entries WHERE status = 'pending'",
                    [],
                    |row| row.get(0),
                )?;
                stats.oldest_pending = sql::parse_opt_ts(0, oldest)?;
                Ok(stats)
            })
            .await
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<DlqEntry> {
    let id: String = row.get(0)?;
    let payload: String = row.get(2)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(DlqEntry {
        id: sql::parse_uuid(0, &id)?,
        original_event: RawEvent::new(row.get::<_, String>(1)?, sql::parse_json(2, &payload)?),
        failure_reason: row.get(3)?,
        retry_count: row.get(4)?,
        status: sql::parse_enum(5, &status)?,
        created_at: sql::parse_ts(6, &created_at)?,
        last_attempt_at: sql::parse_opt_ts(7, row.get(7)?)?,
    })
}
