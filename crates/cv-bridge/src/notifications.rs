//! Best-effort webhook dispatch.
//!
//! Hooks are static configuration. For each event whose type matches a
//! hook's filter, the dispatcher spawns a delivery task that POSTs a JSON
//! envelope, retrying transient failures under the shared retry policy.
//! Every attempt is written to the delivery history. Failures never reach
//! the dead-letter queue and never affect the operation that emitted the
//! event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cv_core::db::{sql, CoordDb};
use cv_core::error::{CoordError, Result};
use cv_core::events::{Event, EventRecord};
use cv_core::types::NotificationHook;
use cv_harness::retry::RetryPolicy;
use cv_telemetry::metrics::{global_metrics, names};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-request timeout of the default transport.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

const DELIVERY_COLUMNS: &str =
    "id, hook_id, event_type, event_cursor, attempt, success, status_code, error, attempted_at";

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DeliveryError {
    pub message: String,
    pub status_code: Option<u16>,
    /// Connect errors, timeouts and 5xx responses are worth retrying.
    pub transient: bool,
}

/// Sends one envelope to one hook URL, returning the HTTP status on success.
#[async_trait]
pub trait HookTransport: Send + Sync {
    async fn post(&self, url: &str, body: &serde_json::Value) -> std::result::Result<u16, DeliveryError>;
}

/// Default transport over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> std::result::Result<Self, reqwest::Error> {
        Self::with_timeout(DELIVERY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HookTransport for ReqwestTransport {
    async fn post(&self, url: &str, body: &serde_json::Value) -> std::result::Result<u16, DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError {
                transient: e.is_connect() || e.is_timeout() || e.is_request(),
                status_code: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(DeliveryError {
                message: format!("hook responded {status}"),
                status_code: Some(status.as_u16()),
                transient: status.is_server_error(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery history
// ---------------------------------------------------------------------------

/// One delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub hook_id: String,
    pub event_type: String,
    /// `None` for synthetic test deliveries.
    pub event_cursor: Option<u64>,
    pub attempt: u32,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct NotificationDispatcher {
    db: Arc<CoordDb>,
    hooks: Vec<NotificationHook>,
    transport: Arc<dyn HookTransport>,
    retry: RetryPolicy,
}

impl NotificationDispatcher {
    pub fn new(
        db: Arc<CoordDb>,
        hooks: Vec<NotificationHook>,
        transport: Arc<dyn HookTransport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            hooks,
            transport,
            retry,
        }
    }

    pub fn hooks(&self) -> &[NotificationHook] {
        &self.hooks
    }

    /// Spawn one delivery per matching hook and return without waiting.
    /// The handles are only useful to callers that want to await completion.
    pub fn dispatch(self: &Arc<Self>, record: &EventRecord) -> Vec<JoinHandle<()>> {
        let event_type = record.event.event_type();
        let matching: Vec<NotificationHook> = self
            .hooks
            .iter()
            .filter(|h| h.accepts(event_type))
            .cloned()
            .collect();
        if matching.is_empty() {
            return Vec::new();
        }

        let envelope = match envelope(self.db.project_id(), record.timestamp, &record.event) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(cursor = record.cursor, error = %e, "could not build notification envelope");
                return Vec::new();
            }
        };
        matching
            .into_iter()
            .map(|hook| {
                let this = Arc::clone(self);
                let envelope = envelope.clone();
                let cursor = record.cursor;
                tokio::spawn(async move {
                    this.deliver(&hook, event_type, Some(cursor), &envelope).await;
                })
            })
            .collect()
    }

    /// Send a synthetic `notification.test` event through one hook and wait
    /// for the final outcome.
    pub async fn test(&self, hook_id: &str) -> Result<DeliveryRecord> {
        let hook = self
            .hooks
            .iter()
            .find(|h| h.id == hook_id)
            .cloned()
            .ok_or_else(|| CoordError::not_found("hook", hook_id))?;
        let event = Event::NotificationTest {
            hook_id: hook.id.clone(),
        };
        let envelope = envelope(self.db.project_id(), Utc::now(), &event)?;
        Ok(self
            .deliver(&hook, event.event_type(), None, &envelope)
            .await)
    }

    /// Most recent delivery attempts, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<DeliveryRecord>> {
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DELIVERY_COLUMNS} FROM notification_deliveries
                     ORDER BY attempted_at DESC, attempt DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], row_to_delivery)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    async fn deliver(
        &self,
        hook: &NotificationHook,
        event_type: &str,
        cursor: Option<u64>,
        envelope: &serde_json::Value,
    ) -> DeliveryRecord {
        let result = self
            .retry
            .run(
                |attempt| async move {
                    let outcome = self.transport.post(&hook.url, envelope).await;
                    let record = DeliveryRecord {
                        id: Uuid::new_v4(),
                        hook_id: hook.id.clone(),
                        event_type: event_type.to_string(),
                        event_cursor: cursor,
                        attempt,
                        success: outcome.is_ok(),
                        status_code: match &outcome {
                            Ok(code) => Some(*code),
                            Err(e) => e.status_code,
                        },
                        error: outcome.as_ref().err().map(|e| e.message.clone()),
                        attempted_at: Utc::now(),
                    };
                    self.record(record.clone()).await;
                    match outcome {
                        Ok(_) => Ok(record),
                        Err(e) => Err(AttemptFailed { record, error: e }),
                    }
                },
                |failed: &AttemptFailed| failed.error.transient,
            )
            .await;

        match result {
            Ok(record) => {
                debug!(hook_id = %hook.id, event_type, attempt = record.attempt, "notification delivered");
                global_metrics()
                    .increment_counter(names::NOTIFICATIONS_TOTAL, &[("outcome", "delivered")]);
                record
            }
            Err(failed) => {
                warn!(
                    hook_id = %hook.id,
                    event_type,
                    attempt = failed.record.attempt,
                    error = %failed.error,
                    "notification delivery failed"
                );
                global_metrics()
                    .increment_counter(names::NOTIFICATIONS_TOTAL, &[("outcome", "failed")]);
                failed.record
            }
        }
    }

    async fn record(&self, record: DeliveryRecord) {
        let id = record.id;
        let written = self
            .db
            .write(move |tx| {
                tx.conn().execute(
                    &format!(
                        "INSERT INTO notification_deliveries ({DELIVERY_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                    ),
                    params![
                        record.id.to_string(),
                        record.hook_id,
                        record.event_type,
                        record.event_cursor.map(|c| c as i64),
                        record.attempt,
                        record.success,
                        record.status_code,
                        record.error,
                        sql::ts(record.attempted_at),
                    ],
                )?;
                Ok(())
            })
            .await;
        if let Err(e) = written {
            warn!(delivery_id = %id, error = %e, "could not record delivery attempt");
        }
    }
}

#[derive(Debug, Error)]
#[error("{error}")]
struct AttemptFailed {
    record: DeliveryRecord,
    error: DeliveryError,
}

/// The generic JSON body every hook receives.
pub fn envelope(
    project_id: &str,
    timestamp: DateTime<Utc>,
    event: &Event,
) -> Result<serde_json::Value> {
    let raw = event.to_raw()?;
    Ok(json!({
        "event_type": raw.event_type,
        "project_id": project_id,
        "timestamp": timestamp,
        "payload": raw.payload,
        "text": summary(project_id, event),
    }))
}

/// One-line human summary of an event.
fn summary(project_id: &str, event: &Event) -> String {
    let detail = match event {
        Event::EscalationCreated {
            task_id,
            severity,
            reason,
            ..
        } => format!("{severity} escalation on {task_id}: {reason}"),
        Event::EscalationCritical {
            task_id, reason, ..
        } => format!("CRITICAL escalation on {task_id}: {reason}"),
        Event::EscalationResolved {
            task_id,
            resolution,
            ..
        } => format!("escalation on {task_id} resolved: {resolution}"),
        Event::TaskBlocked {
            task_id, reason, ..
        } => format!("{task_id} blocked: {reason}"),
        Event::SprintCompleted { sprint_id } => format!("epic {sprint_id} completed"),
        Event::SprintStalled {
            sprint_id,
            incomplete,
        } => format!("epic {sprint_id} stalled with {} incomplete tasks", incomplete.len()),
        Event::AgentStale { agent_id, released, .. } => {
            format!("agent {agent_id} went stale, {} tasks released", released.len())
        }
        Event::NotificationTest { hook_id } => format!("test notification for hook {hook_id}"),
        other => match other.task_id() {
            Some(task_id) => format!("{} on {task_id}", other.event_type()),
            None => other.event_type().to_string(),
        },
    };
    format!("[{project_id}] {detail}")
}

fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryRecord> {
    let id: String = row.get(0)?;
    let cursor: Option<i64> = row.get(3)?;
    let attempted: String = row.get(8)?;
    Ok(DeliveryRecord {
        id: sql::parse_uuid(0, &id)?,
        hook_id: row.get(1)?,
        event_type: row.get(2)?,
        event_cursor: cursor.map(|c| c as u64),
        attempt: row.get(4)?,
        success: row.get(5)?,
        status_code: row.get(6)?,
        error: row.get(7)?,
        attempted_at: sql::parse_ts(8, &attempted)?,
    })
}

/// Spawn a task that feeds every record from `rx` to the dispatcher.
pub fn spawn_dispatch_loop(
    dispatcher: Arc<NotificationDispatcher>,
    rx: flume::Receiver<EventRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(record) = rx.recv_async().await {
            dispatcher.dispatch(&record);
        }
        info!("notification dispatch loop stopped");
    })
}
