use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// StopReason
// ---------------------------------------------------------------------------

/// Why a control loop was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stop for good (daemon shutdown, worker exit).
    Shutdown,
    /// Save a checkpoint at the next safe point, then exit for resume.
    Checkpoint,
}

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative stop coordinator.
///
/// Loops call `subscribe()` and `select!` on [`StopListener::stopped`]
/// alongside their sleep, or poll `reason()` once per cycle. The first
/// `trigger` wins; later triggers are ignored. Listeners that subscribe after
/// the trigger still observe it.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    reason_tx: std::sync::Arc<watch::Sender<Option<StopReason>>>,
    drain_tx: std::sync::Arc<watch::Sender<usize>>,
    drain_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (reason_tx, _) = watch::channel(None);
        let (drain_tx, drain_rx) = watch::channel(0);
        Self {
            reason_tx: std::sync::Arc::new(reason_tx),
            drain_tx: std::sync::Arc::new(drain_tx),
            drain_rx,
        }
    }

    pub fn subscribe(&self) -> StopListener {
        StopListener {
            rx: self.reason_tx.subscribe(),
        }
    }

    /// The pending stop reason, if any (non-blocking).
    pub fn reason(&self) -> Option<StopReason> {
        *self.reason_tx.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.reason().is_some()
    }

    pub fn trigger(&self, reason: StopReason) {
        let won = self.reason_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if won {
            info!(?reason, "stop signal triggered");
        } else {
            warn!(?reason, "stop already triggered");
        }
    }

    /// Shorthand for `trigger(StopReason::Shutdown)`.
    pub fn shutdown(&self) {
        self.trigger(StopReason::Shutdown);
    }

    /// Notify that a component has finished draining.
    pub fn confirm_drained(&self) {
        self.drain_tx.send_modify(|count| *count += 1);
    }

    /// A guard that confirms drain when dropped.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            signal: self.clone(),
        }
    }

    /// Wait for `expected` components to confirm drain, with a timeout.
    pub async fn wait_for_drain(&mut self, expected: usize, timeout: Duration) -> DrainResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let current = *self.drain_rx.borrow();
            if current >= expected {
                info!(count = current, "all components drained");
                return DrainResult::Complete(current);
            }

            match tokio::time::timeout_at(deadline, self.drain_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return DrainResult::Complete(*self.drain_rx.borrow()),
                Err(_) => {
                    let current = *self.drain_rx.borrow();
                    warn!(current, expected, "drain timeout, some components did not confirm");
                    return DrainResult::Timeout {
                        confirmed: current,
                        expected,
                    };
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StopListener
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StopListener {
    rx: watch::Receiver<Option<StopReason>>,
}

impl StopListener {
    /// Resolve once a stop is triggered. Pends forever if the signal is
    /// dropped without triggering.
    pub async fn stopped(&mut self) -> StopReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DrainResult / ShutdownGuard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

/// Calls `confirm_drained()` when dropped.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
