use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::TransactionBehavior;
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::error::{CoordError, Result};
use crate::events::Event;

/// Default upper bound on a single store call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Async SQLite-backed coordination store.
///
/// One database file holds the materialized views (agents, tasks,
/// checkpoints, escalations, dead letters, delivery history) and the
/// append-only event log. Several processes may open the same file; every
/// mutation runs in a `BEGIN IMMEDIATE` transaction that performs a
/// compare-and-set on one record and appends its event atomically.
pub struct CoordDb {
    conn: Connection,
    project_id: String,
    call_timeout: Duration,
}

impl CoordDb {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>, project_id: impl Into<String>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        Self::init(conn, project_id.into()).await
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory(project_id: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, project_id.into()).await
    }

    async fn init(conn: Connection, project_id: String) -> Result<Self> {
        let db = Self {
            conn,
            project_id,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        };
        db.init_schema().await?;
        Ok(db)
    }

    /// Override the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        let fut = self.conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA busy_timeout=5000;
                PRAGMA temp_store=MEMORY;

                CREATE TABLE IF NOT EXISTS events (
                    cursor      INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id  TEXT NOT NULL,
                    event_type  TEXT NOT NULL,
                    task_id     TEXT,
                    payload     TEXT NOT NULL,
                    timestamp   TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_events_project ON events(project_id, cursor);
                CREATE INDEX IF NOT EXISTS idx_events_task    ON events(task_id);

                CREATE TABLE IF NOT EXISTS agents (
                    id                TEXT PRIMARY KEY,
                    name              TEXT NOT NULL,
                    capabilities      TEXT NOT NULL,
                    status            TEXT NOT NULL,
                    last_heartbeat    TEXT NOT NULL,
                    registered_at     TEXT NOT NULL,
                    last_assigned_at  TEXT,
                    stale_since       TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_agents_name ON agents(name);

                CREATE TABLE IF NOT EXISTS tasks (
                    id                     TEXT PRIMARY KEY,
                    sprint_id              TEXT NOT NULL,
                    title                  TEXT NOT NULL,
                    description            TEXT,
                    status                 TEXT NOT NULL,
                    dependencies           TEXT NOT NULL,
                    claimed_by             TEXT,
                    completed_by           TEXT,
                    required_capabilities  TEXT NOT NULL,
                    acceptance_criteria    TEXT NOT NULL,
                    block_reason           TEXT,
                    created_at             TEXT NOT NULL,
                    updated_at             TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_sprint  ON tasks(sprint_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_status  ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_claimed ON tasks(claimed_by);

                CREATE TABLE IF NOT EXISTS verifications (
                    task_id      TEXT NOT NULL,
                    criterion    TEXT NOT NULL,
                    passed       INTEGER NOT NULL,
                    detail       TEXT NOT NULL,
                    recorded_at  TEXT NOT NULL,
                    PRIMARY KEY (task_id, criterion)
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    id              TEXT PRIMARY KEY,
                    task_id         TEXT,
                    sprint_id       TEXT,
                    commit_ref      TEXT NOT NULL,
                    modified_files  TEXT NOT NULL,
                    event_cursor    INTEGER NOT NULL,
                    message         TEXT NOT NULL,
                    created_at      TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_checkpoints_task ON checkpoints(task_id);

                CREATE TABLE IF NOT EXISTS escalations (
                    id           TEXT PRIMARY KEY,
                    task_id      TEXT NOT NULL,
                    reason       TEXT NOT NULL,
                    severity     TEXT NOT NULL,
                    status       TEXT NOT NULL,
                    resolution   TEXT,
                    created_at   TEXT NOT NULL,
                    resolved_at  TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_escalations_status ON escalations(status);

                CREATE TABLE IF NOT EXISTS dlq_entries (
                    id               TEXT PRIMARY KEY,
                    event_type       TEXT NOT NULL,
                    payload          TEXT NOT NULL,
                    failure_reason   TEXT NOT NULL,
                    retry_count      INTEGER NOT NULL DEFAULT 0,
                    status           TEXT NOT NULL,
                    created_at       TEXT NOT NULL,
                    last_attempt_at  TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_dlq_status ON dlq_entries(status);

                CREATE TABLE IF NOT EXISTS notification_deliveries (
                    id            TEXT PRIMARY KEY,
                    hook_id       TEXT NOT NULL,
                    event_type    TEXT NOT NULL,
                    event_cursor  INTEGER,
                    attempt       INTEGER NOT NULL,
                    success       INTEGER NOT NULL,
                    status_code   INTEGER,
                    error         TEXT,
                    attempted_at  TEXT NOT NULL
                );
                ",
            )?;
            Ok(())
        });
        self.bounded(fut).await
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    /// Run a read-only closure against the connection.
    pub async fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let fut = self.conn.call(move |conn| Ok(f(conn)));
        self.bounded(fut).await?
    }

    /// Run a closure inside one immediate transaction. The transaction
    /// commits only when the closure returns `Ok`.
    pub async fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let project_id = self.project_id.clone();
        let fut = self.conn.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut wtx = WriteTx {
                tx,
                project_id,
                now: Utc::now(),
            };
            match f(&mut wtx) {
                Ok(value) => {
                    wtx.tx.commit()?;
                    Ok(Ok(value))
                }
                Err(err) => Ok(Err(err)),
            }
        });
        self.bounded(fut).await?
    }

    async fn bounded<T>(&self, fut: impl Future<Output = tokio_rusqlite::Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(res) => res.map_err(CoordError::from),
            Err(_) => Err(CoordError::Transient(format!(
                "store call exceeded {:?}",
                self.call_timeout
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// WriteTx
// ---------------------------------------------------------------------------

/// A write transaction with event-append support.
pub struct WriteTx<'c> {
    tx: rusqlite::Transaction<'c>,
    project_id: String,
    now: DateTime<Utc>,
}

impl WriteTx<'_> {
    pub fn conn(&self) -> &rusqlite::Connection {
        &self.tx
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Wall-clock time captured when the transaction began.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Append an event to the log and return its cursor.
    pub fn append(&mut self, event: &Event) -> Result<u64> {
        let raw = event.to_raw()?;
        let payload = serde_json::to_string(&raw.payload)?;
        self.tx.execute(
            "INSERT INTO events (project_id, event_type, task_id, payload, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                self.project_id,
                raw.event_type,
                event.task_id(),
                payload,
                sql::ts(self.now),
            ],
        )?;
        let cursor = self.tx.last_insert_rowid() as u64;
        debug!(cursor, event_type = raw.event_type, "event appended");
        Ok(cursor)
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

/// Conversions between domain values and SQLite columns.
pub mod sql {
    use std::str::FromStr;

    use chrono::{DateTime, SecondsFormat, Utc};
    use rusqlite::types::Type;
    use serde::de::DeserializeOwned;
    use uuid::Uuid;

    fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
    }

    /// Fixed-width RFC 3339 so lexical order matches chronological order.
    pub fn ts(dt: DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e.to_string()))
    }

    pub fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
        raw.map(|s| parse_ts(idx, &s)).transpose()
    }

    pub fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
        Uuid::parse_str(raw).map_err(|e| conversion_error(idx, e.to_string()))
    }

    pub fn parse_opt_uuid(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<Uuid>> {
        raw.map(|s| parse_uuid(idx, &s)).transpose()
    }

    pub fn parse_enum<T: FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
        raw.parse().map_err(|e| conversion_error(idx, e))
    }

    pub fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
        serde_json::from_str(raw).map_err(|e| conversion_error(idx, e.to_string()))
    }
}

pub(crate) fn ts_now_minus_days(days: u32) -> String {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
    cutoff.to_rfc3339_opts(SecondsFormat::Micros, true)
}
