use std::future::Future;
use std::time::Duration;

use cv_core::config::RetryConfig;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded retry with exponential backoff.
///
/// Retry is always a caller policy: the store never loops on its own. The
/// closure receives the 1-based attempt number.
///
/// ```ignore
/// let policy = RetryPolicy::from_config(&cfg.retry);
/// let body = policy
///     .run(|attempt| send(attempt), |e: &SendError| e.is_transient())
///     .await?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            multiplier: cfg.multiplier.max(1.0),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }

    /// A single attempt, never retried.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Run `f` until it succeeds, returns an error `retryable` rejects, or
    /// the attempt budget is exhausted. The last error is returned.
    pub async fn run<F, Fut, T, E, R>(&self, mut f: F, retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match f(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt < self.max_attempts && retryable(&err) => {
                    let delay = self.backoff_for(attempt);
                    warn!(attempt, max = self.max_attempts, ?delay, error = %err, "attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
