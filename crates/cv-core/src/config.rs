use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NotificationHook;

/// Top-level configuration loaded from `~/.convoy/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

impl Config {
    /// Load config from `~/.convoy/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        self.retry.validate()?;
        self.notifications.validate()?;
        if self.daemon.patrol_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "daemon.patrol_interval_secs must be > 0".into(),
            ));
        }
        if self.general.project_id.trim().is_empty() {
            return Err(ConfigError::Validation("general.project_id is empty".into()));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        home_dir().join(".convoy").join("config.toml")
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_id")]
    pub project_id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_project_id() -> String {
    "default".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Upper bound on a single store call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn default_store_path() -> String {
    "~/.convoy/coord.db".into()
}
fn default_call_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_agent_threshold_secs: u64,
    /// Consecutive polls without progress before a run is declared stalled.
    #[serde(default = "default_stall_polls")]
    pub stall_polls: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_runtime_secs: None,
            stale_agent_threshold_secs: default_stale_threshold_secs(),
            stall_polls: default_stall_polls(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_secs.map(Duration::from_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_agent_threshold_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.poll_interval_secs must be > 0".into(),
            ));
        }
        if self.stall_polls == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.stall_polls must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}
fn default_stale_threshold_secs() -> u64 {
    300
}
fn default_stall_polls() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interval of the stale-agent / DLQ retention sweep.
    #[serde(default = "default_patrol_interval_secs")]
    pub patrol_interval_secs: u64,
    /// When set, the patrol also prunes checkpoints older than this.
    #[serde(default)]
    pub checkpoint_retention_days: Option<u32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            patrol_interval_secs: default_patrol_interval_secs(),
            checkpoint_retention_days: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    9477
}
fn default_patrol_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// A failed retry that brings an entry to this many attempts abandons it.
    #[serde(default = "default_dlq_max_retries")]
    pub max_retries: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            max_retries: default_dlq_max_retries(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}
fn default_dlq_max_retries() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation("retry.max_attempts must be > 0".into()));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::Validation("retry.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub hooks: Vec<NotificationHook>,
}

impl NotificationsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for hook in &self.hooks {
            if !seen.insert(hook.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate notification hook id `{}`",
                    hook.id
                )));
            }
            if hook.url.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "hook `{}` has an empty url",
                    hook.id
                )));
            }
            if hook.event_filter.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "hook `{}` has an empty event_filter",
                    hook.id
                )));
            }
        }
        Ok(())
    }
}
