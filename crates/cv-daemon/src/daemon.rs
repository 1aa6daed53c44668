use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cv_bridge::event_bus::EventBus;
use cv_bridge::http_api::{api_router, ApiState};
use cv_bridge::notifications::{spawn_dispatch_loop, NotificationDispatcher, ReqwestTransport};
use cv_core::config::Config;
use cv_core::db::CoordDb;
use cv_harness::retry::RetryPolicy;
use cv_harness::shutdown::ShutdownSignal;
use tracing::{error, info};

use crate::patrol::PatrolRunner;
use crate::tailer::EventTailer;

/// How long the API server and tailer get to finish after a stop.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Loop intervals of the daemon's background work.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    /// Stale sweep and retention (default: `daemon.patrol_interval_secs`).
    pub patrol: Duration,
    /// Event log tail feeding the notification dispatcher (default: 1s).
    pub tail: Duration,
}

impl DaemonIntervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            patrol: Duration::from_secs(config.daemon.patrol_interval_secs),
            tail: Duration::from_secs(1),
        }
    }
}

/// The convoy background daemon.
///
/// Serves the HTTP API, tails the event log into the notification
/// dispatcher and runs the patrol loop. Shuts down gracefully when the
/// `ShutdownSignal` is triggered (e.g. via ctrl-c).
pub struct Daemon {
    config: Config,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
    event_bus: EventBus,
    api_state: Arc<ApiState>,
}

impl Daemon {
    /// Create a daemon over an already-open store.
    pub fn with_db(config: Config, db: Arc<CoordDb>) -> Result<Self> {
        let transport =
            ReqwestTransport::new().context("failed to build notification HTTP client")?;
        let notifications = Arc::new(NotificationDispatcher::new(
            Arc::clone(&db),
            config.notifications.hooks.clone(),
            Arc::new(transport),
            RetryPolicy::from_config(&config.retry),
        ));
        let api_state = Arc::new(ApiState::new(db, &config, notifications));
        Ok(Self {
            intervals: DaemonIntervals::from_config(&config),
            config,
            shutdown: ShutdownSignal::new(),
            event_bus: EventBus::new(),
            api_state,
        })
    }

    /// Create a daemon, opening (or creating) the store from config.
    pub async fn new(config: Config) -> Result<Self> {
        let path = config.store.resolved_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db = CoordDb::open(&path, config.general.project_id.clone())
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?
            .with_call_timeout(config.store.call_timeout());
        Self::with_db(config, Arc::new(db))
    }

    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn api_state(&self) -> &Arc<ApiState> {
        &self.api_state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind `daemon.host:daemon.port` and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Run on a pre-bound listener (e.g. port 0 in tests) until shutdown.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        let router = api_router(Arc::clone(&self.api_state));
        let mut server_stop = self.shutdown.subscribe();
        let api_guard = self.shutdown.guard();
        let api_handle = tokio::spawn(async move {
            let _drained = api_guard;
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    server_stop.stopped().await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "API server error");
            }
        });
        info!(%bind_addr, "API server listening");

        let dispatch_handle = spawn_dispatch_loop(
            Arc::clone(&self.api_state.notifications),
            self.event_bus.subscribe(),
        );
        let start = self
            .api_state
            .events
            .head()
            .await
            .context("failed to read event log head")?;
        let tailer = EventTailer::new(
            self.api_state.events.clone(),
            self.event_bus.clone(),
            self.intervals.tail,
        );
        let tail_shutdown = self.shutdown.clone();
        let tail_guard = self.shutdown.guard();
        let tail_handle = tokio::spawn(async move {
            let _drained = tail_guard;
            tailer.run(start, tail_shutdown).await
        });

        info!(
            patrol_secs = self.intervals.patrol.as_secs(),
            event_cursor = start,
            hooks = self.api_state.notifications.hooks().len(),
            "daemon starting event loop"
        );
        self.run_patrol_loop().await;

        let mut drain = self.shutdown.clone();
        if !drain.wait_for_drain(2, DRAIN_TIMEOUT).await.is_complete() {
            api_handle.abort();
            tail_handle.abort();
        }
        dispatch_handle.abort();
        info!("daemon stopped");
        Ok(())
    }

    async fn run_patrol_loop(&self) {
        let state = &self.api_state;
        let patrol = PatrolRunner::new(
            state.registry.clone(),
            state.dlq.clone(),
            state.checkpoints.clone(),
            self.config.dlq.retention_days,
        )
        .with_checkpoint_retention(self.config.daemon.checkpoint_retention_days);

        let mut interval = tokio::time::interval(self.intervals.patrol);
        let mut stop = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = patrol.run_patrol().await {
                        error!(error = %e, "patrol failed");
                    }
                }
                _ = stop.stopped() => {
                    info!("shutdown signal received, stopping background loops");
                    break;
                }
            }
        }
    }
}
