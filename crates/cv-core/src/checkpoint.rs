use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::{sql, ts_now_minus_days, CoordDb};
use crate::error::{CoordError, Result};
use crate::events::Event;
use crate::types::{Checkpoint, NewCheckpoint};

const CHECKPOINT_COLUMNS: &str =
    "id, task_id, sprint_id, commit_ref, modified_files, event_cursor, message, created_at";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointFilter {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub sprint_id: Option<String>,
    /// Only checkpoints without a task (orchestrator-level).
    #[serde(default)]
    pub orchestrator_only: bool,
}

impl CheckpointFilter {
    pub fn orchestrator(sprint_id: impl Into<String>) -> Self {
        Self {
            task_id: None,
            sprint_id: Some(sprint_id.into()),
            orchestrator_only: true,
        }
    }
}

/// Immutable recovery snapshots tied to an event cursor.
#[derive(Clone)]
pub struct CheckpointManager {
    db: Arc<CoordDb>,
}

impl CheckpointManager {
    pub fn new(db: Arc<CoordDb>) -> Self {
        Self { db }
    }

    /// Snapshot the current log head together with caller-supplied commit
    /// and file information.
    pub async fn create(&self, new: NewCheckpoint) -> Result<Checkpoint> {
        let checkpoint = self
            .db
            .write(move |tx| {
                let head: Option<i64> = tx.conn().query_row(
                    "SELECT MAX(cursor) FROM events WHERE project_id = ?1",
                    params![tx.project_id()],
                    |row| row.get(0),
                )?;
                let checkpoint = Checkpoint {
                    id: Uuid::new_v4(),
                    task_id: new.task_id,
                    sprint_id: new.sprint_id,
                    commit_ref: new.commit_ref,
                    modified_files: new.modified_files,
                    event_cursor: head.unwrap_or(0) as u64,
                    message: new.message,
                    created_at: tx.now(),
                };
                tx.conn().execute(
                    &format!(
                        "INSERT INTO checkpoints ({CHECKPOINT_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                    ),
                    params![
                        checkpoint.id.to_string(),
                        checkpoint.task_id,
                        checkpoint.sprint_id,
                        checkpoint.commit_ref,
                        serde_json::to_string(&checkpoint.modified_files)?,
                        checkpoint.event_cursor as i64,
                        checkpoint.message,
                        sql::ts(checkpoint.created_at),
                    ],
                )?;
                tx.append(&Event::CheckpointCreated {
                    checkpoint_id: checkpoint.id,
                    task_id: checkpoint.task_id.clone(),
                    event_cursor: checkpoint.event_cursor,
                })?;
                Ok(checkpoint)
            })
            .await?;
        info!(
            checkpoint_id = %checkpoint.id,
            cursor = checkpoint.event_cursor,
            task_id = ?checkpoint.task_id,
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    pub async fn get(&self, id: Uuid) -> Result<Checkpoint> {
        self.db
            .read(move |conn| {
                conn.query_row(
                    &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1"),
                    params![id.to_string()],
                    row_to_checkpoint,
                )
                .optional()?
                .ok_or_else(|| CoordError::not_found("checkpoint", id))
            })
            .await
    }

    /// Matching checkpoints, newest first.
    pub async fn list(&self, filter: CheckpointFilter) -> Result<Vec<Checkpoint>> {
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
                     WHERE (?1 IS NULL OR task_id = ?1)
                       AND (?2 IS NULL OR sprint_id = ?2)
                       AND (?3 = 0 OR task_id IS NULL)
                     ORDER BY event_cursor DESC, created_at DESC"
                ))?;
                let rows = stmt.query_map(
                    params![filter.task_id, filter.sprint_id, filter.orchestrator_only],
                    row_to_checkpoint,
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    pub async fn latest(&self, filter: CheckpointFilter) -> Result<Option<Checkpoint>> {
        Ok(self.list(filter).await?.into_iter().next())
    }

    /// Delete checkpoints created more than `older_than_days` ago.
    pub async fn prune(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = ts_now_minus_days(older_than_days);
        let removed = self
            .db
            .write(move |tx| {
                Ok(tx
                    .conn()
                    .execute("DELETE FROM checkpoints WHERE created_at < ?1", params![cutoff])?)
            })
            .await?;
        info!(removed, older_than_days, "checkpoints pruned");
        Ok(removed)
    }
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
    let id: String = row.get(0)?;
    let files: String = row.get(4)?;
    let cursor: i64 = row.get(5)?;
    let created_at: String = row.get(7)?;
    Ok(Checkpoint {
        id: sql::parse_uuid(0, &id)?,
        task_id: row.get(1)?,
        sprint_id: row.get(2)?,
        commit_ref: row.get(3)?,
        modified_files: sql::parse_json(4, &files)?,
        event_cursor: cursor as u64,
        message: row.get(6)?,
        created_at: sql::parse_ts(7, &created_at)?,
    })
}
