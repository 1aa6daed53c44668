use std::sync::Arc;

use cv_core::db::{sql, CoordDb, WriteTx};
use cv_core::error::{CoordError, Precondition, Result};
use cv_core::events::Event;
use cv_core::types::{Escalation, EscalationStatus, Severity, TaskId};
use cv_telemetry::metrics::{global_metrics, names};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const ESCALATION_COLUMNS: &str =
    "id, task_id, reason, severity, status, resolution, created_at, resolved_at";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationFilter {
    #[serde(default)]
    pub status: Option<EscalationStatus>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

impl EscalationFilter {
    pub fn open() -> Self {
        Self {
            status: Some(EscalationStatus::Open),
            ..Self::default()
        }
    }
}

/// Requests for a human decision on blocked tasks.
///
/// `resolve` is the only human-driven mutation: it succeeds once per
/// escalation and every later attempt fails with `AlreadyResolved`, leaving
/// the first resolution untouched.
#[derive(Clone)]
pub struct EscalationManager {
    db: Arc<CoordDb>,
}

impl EscalationManager {
    pub fn new(db: Arc<CoordDb>) -> Self {
        Self { db }
    }

    pub async fn create(&self, task_id: &str, reason: &str, severity: Severity) -> Result<Escalation> {
        self.create_with_id(Uuid::new_v4(), task_id, reason, severity)
            .await
    }

    /// Create under a caller-chosen ID, as when re-applying a recorded
    /// `escalation.created` event.
    pub async fn create_with_id(
        &self,
        id: Uuid,
        task_id: &str,
        reason: &str,
        severity: Severity,
    ) -> Result<Escalation> {
        let task_id = task_id.to_string();
        let reason = reason.to_string();
        let escalation = self
            .db
            .write(move |tx| {
                if load(tx.conn(), id)?.is_some() {
                    return Err(Precondition::AlreadyExists {
                        entity: "escalation",
                        id: id.to_string(),
                    }
                    .into());
                }
                require_task(tx, &task_id)?;
                let escalation = Escalation {
                    id,
                    task_id,
                    reason,
                    severity,
                    status: EscalationStatus::Open,
                    resolution: None,
                    created_at: tx.now(),
                    resolved_at: None,
                };
                tx.conn().execute(
                    &format!(
                        "INSERT INTO escalations ({ESCALATION_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, NULL)"
                    ),
                    params![
                        escalation.id.to_string(),
                        escalation.task_id,
                        escalation.reason,
                        escalation.severity.as_str(),
                        escalation.status.as_str(),
                        sql::ts(escalation.created_at),
                    ],
                )?;
                tx.append(&Event::EscalationCreated {
                    escalation_id: escalation.id,
                    task_id: escalation.task_id.clone(),
                    severity,
                    reason: escalation.reason.clone(),
                })?;
                if severity == Severity::Critical {
                    tx.append(&Event::EscalationCritical {
                        escalation_id: escalation.id,
                        task_id: escalation.task_id.clone(),
                        reason: escalation.reason.clone(),
                    })?;
                }
                Ok(escalation)
            })
            .await?;

        global_metrics().increment_counter(
            names::ESCALATIONS_TOTAL,
            &[("severity", escalation.severity.as_str())],
        );
        if escalation.severity == Severity::Critical {
            warn!(
                escalation_id = %escalation.id,
                task_id = %escalation.task_id,
                reason = %escalation.reason,
                "critical escalation raised"
            );
        } else {
            info!(
                escalation_id = %escalation.id,
                task_id = %escalation.task_id,
                severity = %escalation.severity,
                "escalation raised"
            );
        }
        Ok(escalation)
    }

    pub async fn get(&self, id: Uuid) -> Result<Escalation> {
        self.db
            .read(move |conn| load(conn, id)?.ok_or_else(|| CoordError::not_found("escalation", id)))
            .await
    }

    /// Escalations matching `filter`, newest first.
    pub async fn list(&self, filter: EscalationFilter) -> Result<Vec<Escalation>> {
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ESCALATION_COLUMNS} FROM escalations
                     WHERE (?1 IS NULL OR status = ?1)
                       AND (?2 IS NULL OR severity = ?2)
                       AND (?3 IS NULL OR task_id = ?3)
                     ORDER BY created_at DESC, id ASC"
                ))?;
                let rows = stmt.query_map(
                    params![
                        filter.status.map(|s| s.as_str()),
                        filter.severity.map(|s| s.as_str()),
                        filter.task_id,
                    ],
                    row_to_escalation,
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    pub async fn resolve(&self, id: Uuid, resolution: &str) -> Result<Escalation> {
        if resolution.trim().is_empty() {
            return Err(Precondition::Invalid("resolution is empty".into()).into());
        }
        let resolution = resolution.to_string();
        let escalation = self
            .db
            .write(move |tx| {
                let mut escalation =
                    load(tx.conn(), id)?.ok_or_else(|| CoordError::not_found("escalation", id))?;
                let now = tx.now();
                let changed = tx.conn().execute(
                    "UPDATE escalations SET status = ?1, resolution = ?2, resolved_at = ?3
                     WHERE id = ?4 AND status = ?5",
                    params![
                        EscalationStatus::Resolved.as_str(),
                        resolution,
                        sql::ts(now),
                        id.to_string(),
                        EscalationStatus::Open.as_str(),
                    ],
                )?;
                if changed == 0 {
                    return Err(Precondition::AlreadyResolved(id.to_string()).into());
                }
                escalation.status = EscalationStatus::Resolved;
                escalation.resolution = Some(resolution.clone());
                escalation.resolved_at = Some(now);
                tx.append(&Event::EscalationResolved {
                    escalation_id: id,
                    task_id: escalation.task_id.clone(),
                    resolution,
                })?;
                Ok(escalation)
            })
            .await?;
        info!(escalation_id = %id, task_id = %escalation.task_id, "escalation resolved");
        Ok(escalation)
    }
}

fn require_task(tx: &WriteTx<'_>, task_id: &str) -> Result<()> {
    let exists: Option<String> = tx
        .conn()
        .query_row("SELECT id FROM tasks WHERE id = ?1", params![task_id], |row| row.get(0))
        .optional()?;
    match exists {
        Some(_) => Ok(()),
        None => Err(CoordError::not_found("task", task_id)),
    }
}

fn load(conn: &rusqlite::Connection, id: Uuid) -> Result<Option<Escalation>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ESCALATION_COLUMNS} FROM escalations WHERE id = ?1"),
            params![id.to_string()],
            row_to_escalation,
        )
        .optional()?)
}

fn row_to_escalation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Escalation> {
    let id: String = row.get(0)?;
    let severity: String = row.get(3)?;
    let status: String = row.get(4)?;
    let created: String = row.get(6)?;
    Ok(Escalation {
        id: sql::parse_uuid(0, &id)?,
        task_id: row.get(1)?,
        reason: row.get(2)?,
        severity: sql::parse_enum(3, &severity)?,
        status: sql::parse_enum(4, &status)?,
        resolution: row.get(5)?,
        created_at: sql::parse_ts(6, &created)?,
        resolved_at: sql::parse_opt_ts(7, row.get(7)?)?,
    })
}
