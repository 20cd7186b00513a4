//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::task::TaskCategory;
use crate::{AppError, Result};

/// Retry backoff curve between failed attempts.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffCurve {
    /// Delay grows by `base` on every attempt.
    Linear,
    /// Delay doubles from `base` on every attempt.
    Exponential,
}

/// Retry backoff tuning for the supervisor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BackoffConfig {
    /// Curve applied between attempts.
    #[serde(default = "default_backoff_curve")]
    pub curve: BackoffCurve,
    /// Base delay before the first retry.
    #[serde(default = "default_backoff_base_seconds")]
    pub base_seconds: u64,
    /// Ceiling on the delay regardless of attempt count.
    #[serde(default = "default_backoff_cap_seconds")]
    pub cap_seconds: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            curve: default_backoff_curve(),
            base_seconds: default_backoff_base_seconds(),
            cap_seconds: default_backoff_cap_seconds(),
        }
    }
}

impl BackoffConfig {
    /// Delay to sleep before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_seconds.max(1);
        let secs = match self.curve {
            BackoffCurve::Linear => base.saturating_mul(u64::from(attempt)),
            BackoffCurve::Exponential => {
                base.saturating_mul(1_u64 << attempt.saturating_sub(1).min(32))
            }
        };
        Duration::from_secs(secs.min(self.cap_seconds.max(base)))
    }
}

fn default_backoff_curve() -> BackoffCurve {
    BackoffCurve::Exponential
}

fn default_backoff_base_seconds() -> u64 {
    2
}

fn default_backoff_cap_seconds() -> u64 {
    60
}

/// Process supervision thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Silence window before a session is marked idle.
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,
    /// Hard wall-clock ceiling for one attempt.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Grace period between soft stop and hard kill.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
    /// Backoff applied between retry attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            idle_seconds: default_idle_seconds(),
            timeout_seconds: default_timeout_seconds(),
            grace_seconds: default_grace_seconds(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_idle_seconds() -> u64 {
    60
}

fn default_timeout_seconds() -> u64 {
    7200
}

fn default_grace_seconds() -> u64 {
    10
}

/// Event hub tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HubConfig {
    /// Interval between heartbeat events for each active run.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    /// Maximum buffered events retained per run for replay.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Broadcast channel capacity per subscriber before lag cut-off.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_seconds: default_heartbeat_seconds(),
            history_capacity: default_history_capacity(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

fn default_heartbeat_seconds() -> u64 {
    15
}

fn default_history_capacity() -> usize {
    1024
}

fn default_broadcast_capacity() -> usize {
    1024
}

/// Session store location and lock tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StoreConfig {
    /// Backing document path; defaults to `<workspace>/.foreman/sessions.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Overall deadline for one lock acquisition.
    #[serde(default = "default_lock_deadline_ms")]
    pub lock_deadline_ms: u64,
    /// TTL after which a leftover lock file is considered stale.
    #[serde(default = "default_lock_stale_ms")]
    pub lock_stale_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            lock_deadline_ms: default_lock_deadline_ms(),
            lock_stale_ms: default_lock_stale_ms(),
        }
    }
}

fn default_lock_deadline_ms() -> u64 {
    5000
}

fn default_lock_stale_ms() -> u64 {
    30_000
}

fn default_http_port() -> u16 {
    4700
}

fn default_category_ceilings() -> HashMap<TaskCategory, u32> {
    HashMap::from([(TaskCategory::Primary, 2), (TaskCategory::Worker, 4)])
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Default workspace root used when a task carries no project root.
    pub workspace_root: PathBuf,
    /// Supervised agent binary (e.g., `claude`, `codex`).
    pub agent_cli: String,
    /// Default arguments for the agent binary.
    #[serde(default)]
    pub agent_cli_args: Vec<String>,
    /// Environment overrides injected into every spawned process.
    #[serde(default)]
    pub env_overrides: HashMap<String, String>,
    /// Maximum concurrent tasks per category.
    #[serde(default = "default_category_ceilings")]
    pub category_ceilings: HashMap<TaskCategory, u32>,
    /// Whether a failed wave halts the run or lets later waves proceed.
    #[serde(default)]
    pub wave_policy: WavePolicy,
    /// HTTP port for the ingest and streaming endpoints.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Supervision thresholds.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Event hub tuning.
    #[serde(default)]
    pub hub: HubConfig,
    /// Session store location and lock tuning.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Wave-advance policy when a wave contains failed tasks.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WavePolicy {
    /// Stop the run at the first wave with a failed task.
    #[default]
    Halt,
    /// Keep releasing later waves; dependents of failed tasks are failed.
    Continue,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved path of the session store backing document.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.workspace_root.join(".foreman").join("sessions.json"))
    }

    /// Concurrency ceiling for a category; unconfigured categories get 1.
    #[must_use]
    pub fn ceiling_for(&self, category: TaskCategory) -> u32 {
        self.category_ceilings.get(&category).copied().unwrap_or(1)
    }

    /// Idle window as a [`Duration`].
    #[must_use]
    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.supervisor.idle_seconds)
    }

    /// Hard attempt timeout as a [`Duration`].
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.timeout_seconds)
    }

    /// Soft-stop grace period as a [`Duration`].
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.supervisor.grace_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        if self.agent_cli.trim().is_empty() {
            return Err(AppError::Config("agent_cli must not be empty".into()));
        }

        if self.supervisor.idle_seconds == 0 {
            return Err(AppError::Config(
                "supervisor.idle_seconds must be greater than zero".into(),
            ));
        }

        if self.supervisor.timeout_seconds == 0 {
            return Err(AppError::Config(
                "supervisor.timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.hub.history_capacity == 0 {
            return Err(AppError::Config(
                "hub.history_capacity must be greater than zero".into(),
            ));
        }

        if let Some(zero) = self
            .category_ceilings
            .iter()
            .find(|(_, ceiling)| **ceiling == 0)
        {
            return Err(AppError::Config(format!(
                "category ceiling for {:?} must be greater than zero",
                zero.0
            )));
        }

        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}
