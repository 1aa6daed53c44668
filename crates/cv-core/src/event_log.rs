use std::sync::Arc;

use rusqlite::params;

use crate::db::{sql, CoordDb};
use crate::error::{CoordError, Result};
use crate::events::{Event, EventRecord, RawEvent};

/// Append-only, per-project event stream.
#[derive(Clone)]
pub struct EventLog {
    db: Arc<CoordDb>,
}

impl EventLog {
    pub fn new(db: Arc<CoordDb>) -> Self {
        Self { db }
    }

    /// Append a single event outside of any state mutation.
    pub async fn append(&self, event: Event) -> Result<u64> {
        self.db.write(move |tx| tx.append(&event)).await
    }

    /// Cursor of the newest event for this project, or 0 when empty.
    pub async fn head(&self) -> Result<u64> {
        let project_id = self.db.project_id().to_string();
        self.db
            .read(move |conn| {
                let head: Option<i64> = conn.query_row(
                    "SELECT MAX(cursor) FROM events WHERE project_id = ?1",
                    params![project_id],
                    |row| row.get(0),
                )?;
                Ok(head.unwrap_or(0) as u64)
            })
            .await
    }

    /// Events with cursor strictly greater than `after`, oldest first.
    pub async fn read_from(&self, after: u64, limit: usize) -> Result<Vec<EventRecord>> {
        let project_id = self.db.project_id().to_string();
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT cursor, project_id, event_type, payload, timestamp
                     FROM events WHERE project_id = ?1 AND cursor > ?2
                     ORDER BY cursor ASC LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![project_id, after as i64, limit as i64],
                    read_row,
                )?;
                let mut out = Vec::new();
                for row in rows {
                    let (cursor, project_id, raw, ts) = row?;
                    let event = raw.parse().map_err(|e| {
                        CoordError::Fatal(format!("event {cursor} in log does not parse: {e}"))
                    })?;
                    out.push(EventRecord {
                        cursor,
                        project_id,
                        timestamp: ts,
                        event,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Events in `(after, upto]`, oldest first.
    pub async fn read_range(&self, after: u64, upto: u64) -> Result<Vec<EventRecord>> {
        if upto <= after {
            return Ok(Vec::new());
        }
        let records = self.read_from(after, (upto - after) as usize).await?;
        Ok(records.into_iter().filter(|r| r.cursor <= upto).collect())
    }
}

type Row = (u64, String, RawEvent, chrono::DateTime<chrono::Utc>);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    let cursor: i64 = row.get(0)?;
    let project_id: String = row.get(1)?;
    let event_type: String = row.get(2)?;
    let payload: String = row.get(3)?;
    let ts: String = row.get(4)?;
    Ok((
        cursor as u64,
        project_id,
        RawEvent::new(event_type, sql::parse_json(3, &payload)?),
        sql::parse_ts(4, &ts)?,
    ))
}
