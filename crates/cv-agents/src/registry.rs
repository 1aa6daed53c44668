use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cv_core::db::{sql, CoordDb, WriteTx};
use cv_core::error::{CoordError, Precondition, Result};
use cv_core::events::{Event, ReleaseReason};
use cv_core::task_store::release_owned_tx;
use cv_core::types::{Agent, AgentId, AgentStatus, TaskId};
use cv_telemetry::metrics::{global_metrics, names};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const AGENT_COLUMNS: &str =
    "id, name, capabilities, status, last_heartbeat, registered_at, last_assigned_at";

// ---------------------------------------------------------------------------
// Filters & results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFilter {
    /// Matched against the effective status (staleness folded in).
    #[serde(default)]
    pub status: Option<AgentStatus>,
    #[serde(default)]
    pub capability: Option<String>,
}

/// An agent that `detect_stale` newly marked, with the tasks it lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleAgent {
    pub agent: Agent,
    pub released: Vec<TaskId>,
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

/// Registered agent identities, capabilities and liveness.
///
/// Staleness is never stored: every read folds `now - last_heartbeat`
/// against the threshold into the returned `status`. The private
/// `stale_since` column only records that stale handling already ran.
#[derive(Clone)]
pub struct AgentRegistry {
    db: Arc<CoordDb>,
    stale_threshold: Duration,
}

impl AgentRegistry {
    pub fn new(db: Arc<CoordDb>, stale_threshold: Duration) -> Self {
        Self {
            db,
            stale_threshold,
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    pub async fn register(&self, name: &str, capabilities: BTreeSet<String>) -> Result<Agent> {
        self.register_with_id(Uuid::new_v4(), name, capabilities).await
    }

    /// Register under a caller-chosen ID (used when re-applying a recorded
    /// `agent.registered` event).
    ///
    /// A stale agent holding the same name is replaced: its tasks are
    /// released and its record removed before the new identity is issued.
    pub async fn register_with_id(
        &self,
        id: AgentId,
        name: &str,
        capabilities: BTreeSet<String>,
    ) -> Result<Agent> {
        if name.trim().is_empty() {
            return Err(Precondition::Invalid("agent name is empty".into()).into());
        }
        let name = name.to_string();
        let threshold = self.stale_threshold;
        let agent = self
            .db
            .write(move |tx| {
                if load(tx.conn(), id)?.is_some() {
                    return Err(Precondition::AlreadyExists {
                        entity: "agent",
                        id: id.to_string(),
                    }
                    .into());
                }
                let now = tx.now();
                for holder in by_name(tx.conn(), &name)? {
                    if !holder.is_stale_at(now, threshold) {
                        return Err(Precondition::DuplicateName(name.clone()).into());
                    }
                    let released = remove(tx, holder.id, ReleaseReason::Stale)?;
                    info!(agent_id = %holder.id, %name, released = released.len(), "replaced stale agent");
                }

                let agent = Agent {
                    id,
                    name: name.clone(),
                    capabilities,
                    status: AgentStatus::Active,
                    last_heartbeat: now,
                    registered_at: now,
                    last_assigned_at: None,
                };
                tx.conn().execute(
                    &format!(
                        "INSERT INTO agents ({AGENT_COLUMNS}, stale_since)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL)"
                    ),
                    params![
                        agent.id.to_string(),
                        agent.name,
                        serde_json::to_string(&agent.capabilities)?,
                        agent.status.as_str(),
                        sql::ts(now),
                        sql::ts(now),
                    ],
                )?;
                tx.append(&Event::AgentRegistered {
                    agent_id: agent.id,
                    name: agent.name.clone(),
                    capabilities: agent.capabilities.clone(),
                })?;
                Ok(agent)
            })
            .await?;
        info!(agent_id = %agent.id, name = %agent.name, "agent registered");
        Ok(agent)
    }

    /// Refresh liveness and optionally switch between `active` and `idle`.
    pub async fn heartbeat(&self, agent_id: AgentId, status: Option<AgentStatus>) -> Result<Agent> {
        if status == Some(AgentStatus::Stale) {
            return Err(Precondition::Invalid("stale is derived, not reported".into()).into());
        }
        self.db
            .write(move |tx| {
                let mut agent = load(tx.conn(), agent_id)?
                    .ok_or_else(|| CoordError::not_found("agent", agent_id))?;
                let now = tx.now();
                if let Some(status) = status {
                    agent.status = status;
                }
                agent.last_heartbeat = now;
                tx.conn().execute(
                    "UPDATE agents SET last_heartbeat = ?1, status = ?2, stale_since = NULL
                     WHERE id = ?3",
                    params![sql::ts(now), agent.status.as_str(), agent_id.to_string()],
                )?;
                tx.append(&Event::AgentHeartbeat { agent_id, status })?;
                Ok(agent)
            })
            .await
    }

    pub async fn get(&self, agent_id: AgentId) -> Result<Agent> {
        let threshold = self.stale_threshold;
        self.db
            .read(move |conn| {
                let agent =
                    load(conn, agent_id)?.ok_or_else(|| CoordError::not_found("agent", agent_id))?;
                Ok(effective(agent, Utc::now(), threshold))
            })
            .await
    }

    /// Agents matching `filter`, ordered by name.
    pub async fn list(&self, filter: AgentFilter) -> Result<Vec<Agent>> {
        let threshold = self.stale_threshold;
        self.db
            .read(move |conn| {
                let now = Utc::now();
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AGENT_COLUMNS} FROM agents ORDER BY name ASC, id ASC"
                ))?;
                let agents = stmt
                    .query_map([], row_to_agent)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(agents
                    .into_iter()
                    .map(|a| effective(a, now, threshold))
                    .filter(|a| filter.status.is_none_or(|s| a.status == s))
                    .filter(|a| {
                        filter
                            .capability
                            .as_ref()
                            .is_none_or(|c| a.capabilities.contains(c))
                    })
                    .collect())
            })
            .await
    }

    /// Remove an agent, releasing its claimed and in-progress tasks.
    pub async fn deregister(&self, agent_id: AgentId) -> Result<Vec<TaskId>> {
        let released = self
            .db
            .write(move |tx| {
                if load(tx.conn(), agent_id)?.is_none() {
                    return Err(CoordError::not_found("agent", agent_id));
                }
                remove(tx, agent_id, ReleaseReason::Deregistered)
            })
            .await?;
        info!(%agent_id, released = released.len(), "agent deregistered");
        Ok(released)
    }

    /// Mark newly stale agents and release their tasks.
    ///
    /// Safe to run concurrently from several processes: an agent is handled
    /// by whichever caller first sets its `stale_since` marker, and a second
    /// sweep without an intervening heartbeat changes nothing.
    pub async fn detect_stale(&self) -> Result<Vec<StaleAgent>> {
        let threshold = self.stale_threshold;
        let stale = self
            .db
            .write(move |tx| {
                let now = tx.now();
                let candidates: Vec<Agent> = {
                    let mut stmt = tx.conn().prepare(&format!(
                        "SELECT {AGENT_COLUMNS} FROM agents WHERE stale_since IS NULL ORDER BY id"
                    ))?;
                    let rows = stmt.query_map([], row_to_agent)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };

                let mut out = Vec::new();
                for agent in candidates {
                    if !agent.is_stale_at(now, threshold) {
                        continue;
                    }
                    let marked = tx.conn().execute(
                        "UPDATE agents SET stale_since = ?1
                         WHERE id = ?2 AND stale_since IS NULL AND last_heartbeat = ?3",
                        params![
                            sql::ts(now),
                            agent.id.to_string(),
                            sql::ts(agent.last_heartbeat)
                        ],
                    )?;
                    if marked == 0 {
                        continue;
                    }
                    let released = release_owned_tx(tx, agent.id, ReleaseReason::Stale)?;
                    tx.append(&Event::AgentStale {
                        agent_id: agent.id,
                        last_heartbeat: agent.last_heartbeat,
                        released: released.clone(),
                    })?;
                    out.push(StaleAgent {
                        agent: effective(agent, now, threshold),
                        released,
                    });
                }
                Ok(out)
            })
            .await?;

        for s in &stale {
            warn!(
                agent_id = %s.agent.id,
                name = %s.agent.name,
                released = ?s.released,
                "agent went stale"
            );
            global_metrics().increment_counter(names::AGENTS_STALE_TOTAL, &[]);
        }
        Ok(stale)
    }

    /// Record that the orchestrator assigned work to `agent_id`.
    pub async fn mark_assigned(&self, agent_id: AgentId) -> Result<()> {
        self.db
            .write(move |tx| {
                touch_assigned(tx, agent_id)?;
                Ok(())
            })
            .await
    }

    /// Offer a task to an agent: stamps `last_assigned_at` and appends
    /// `task.offered`, atomically.
    pub async fn record_offer(&self, task_id: &str, agent_id: AgentId) -> Result<u64> {
        let task_id = task_id.to_string();
        self.db
            .write(move |tx| {
                touch_assigned(tx, agent_id)?;
                tx.append(&Event::TaskOffered { task_id, agent_id })
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn touch_assigned(tx: &mut WriteTx<'_>, agent_id: AgentId) -> Result<()> {
    let changed = tx.conn().execute(
        "UPDATE agents SET last_assigned_at = ?1 WHERE id = ?2",
        params![sql::ts(tx.now()), agent_id.to_string()],
    )?;
    if changed == 0 {
        return Err(CoordError::not_found("agent", agent_id));
    }
    Ok(())
}

fn remove(tx: &mut WriteTx<'_>, agent_id: AgentId, reason: ReleaseReason) -> Result<Vec<TaskId>> {
    let released = release_owned_tx(tx, agent_id, reason)?;
    tx.conn()
        .execute("DELETE FROM agents WHERE id = ?1", params![agent_id.to_string()])?;
    tx.append(&Event::AgentDeregistered {
        agent_id,
        released: released.clone(),
    })?;
    Ok(released)
}

fn effective(mut agent: Agent, now: DateTime<Utc>, threshold: Duration) -> Agent {
    agent.status = agent.effective_status(now, threshold);
    agent
}

fn load(conn: &rusqlite::Connection, id: AgentId) -> Result<Option<Agent>> {
    Ok(conn
        .query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
            params![id.to_string()],
            row_to_agent,
        )
        .optional()?)
}

fn by_name(conn: &rusqlite::Connection, name: &str) -> Result<Vec<Agent>> {
    let mut stmt = conn.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?1"))?;
    let rows = stmt.query_map(params![name], row_to_agent)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let id: String = row.get(0)?;
    let caps: String = row.get(2)?;
    let status: String = row.get(3)?;
    let heartbeat: String = row.get(4)?;
    let registered: String = row.get(5)?;
    Ok(Agent {
        id: sql::parse_uuid(0, &id)?,
        name: row.get(1)?,
        capabilities: sql::parse_json(2, &caps)?,
        status: sql::parse_enum(3, &status)?,
        last_heartbeat: sql::parse_ts(4, &heartbeat)?,
        registered_at: sql::parse_ts(5, &registered)?,
        last_assigned_at: sql::parse_opt_ts(6, row.get(6)?)?,
    })
}
