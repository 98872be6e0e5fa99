//! Guardian Configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::types::{GuardianError, Result};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "GUARDIAN_CONFIG";

/// Config file used when `GUARDIAN_CONFIG` is unset
const DEFAULT_CONFIG_FILE: &str = "guardian.toml";

/// Prefix for environment overrides, e.g. `GUARDIAN__SUPERVISOR__MAX_RESTARTS`
const ENV_PREFIX: &str = "GUARDIAN";
const ENV_SEPARATOR: &str = "__";

/// Upper bound for every `*_secs` setting (one year)
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Top-level guardian configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuardianConfig {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    pub worker: WorkerConfig,
    /// Directory for the event journal and status snapshot
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GuardianConfig {
    /// Load from the file named by `GUARDIAN_CONFIG` (default `guardian.toml`,
    /// optional) with `GUARDIAN__*` environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path)
    }

    /// Load from a specific file path with environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("worker.args"),
            )
            .build()?;

        let config: GuardianConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the supervisor cannot run with
    pub fn validate(&self) -> Result<()> {
        self.supervisor.validate()?;
        self.worker.validate()?;
        Ok(())
    }
}

/// Restart and probe policy
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct SupervisorConfig {
    /// Seconds between health probes
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Maximum age of the worker's last decision before it counts as unhealthy
    #[serde(default = "default_max_no_response_secs")]
    pub max_no_response_secs: u64,
    /// Consecutive failed probes before a restart
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Restarts allowed per rolling window before halting
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Rolling window length in seconds
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,
    /// Warm-up time after spawn before the first probe
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,
    /// Wait after SIGTERM before SIGKILL
    #[serde(default = "default_termination_grace_secs")]
    pub termination_grace_secs: u64,
    /// Upper bound on one health request
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// First restart delay
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Cap on any restart delay
    #[serde(default = "default_backoff_ceiling_secs")]
    pub backoff_ceiling_secs: u64,
    /// Spawn attempts per start before giving up
    #[serde(default = "default_max_spawn_attempts")]
    pub max_spawn_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            max_no_response_secs: default_max_no_response_secs(),
            failure_threshold: default_failure_threshold(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
            startup_grace_secs: default_startup_grace_secs(),
            termination_grace_secs: default_termination_grace_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_ceiling_secs: default_backoff_ceiling_secs(),
            max_spawn_attempts: default_max_spawn_attempts(),
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn restart_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(Duration::from_secs(self.restart_window_secs))
            .unwrap_or_else(|_| chrono::Duration::max_value())
    }

    /// Restart backoff: doubling from the base, capped at the ceiling
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_base_secs),
            2,
            Duration::from_secs(self.backoff_ceiling_secs),
        )
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("check_interval_secs", self.check_interval_secs),
            ("max_no_response_secs", self.max_no_response_secs),
            ("failure_threshold", self.failure_threshold as u64),
            ("max_restarts", self.max_restarts as u64),
            ("restart_window_secs", self.restart_window_secs),
            ("startup_grace_secs", self.startup_grace_secs),
            ("termination_grace_secs", self.termination_grace_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("backoff_base_secs", self.backoff_base_secs),
            ("backoff_ceiling_secs", self.backoff_ceiling_secs),
            ("max_spawn_attempts", self.max_spawn_attempts as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(GuardianError::Config(format!(
                "supervisor.{} must be positive",
                name
            )));
        }

        if let Some((name, value)) = positive
            .iter()
            .filter(|(name, _)| name.ends_with("_secs"))
            .find(|(_, v)| *v > MAX_DURATION_SECS)
        {
            return Err(GuardianError::Config(format!(
                "supervisor.{} ({}) exceeds the maximum of {}s",
                name, value, MAX_DURATION_SECS
            )));
        }

        if self.max_no_response_secs <= self.check_interval_secs {
            return Err(GuardianError::Config(format!(
                "supervisor.max_no_response_secs ({}) must exceed check_interval_secs ({})",
                self.max_no_response_secs, self.check_interval_secs
            )));
        }

        if self.probe_timeout_secs >= self.check_interval_secs {
            return Err(GuardianError::Config(format!(
                "supervisor.probe_timeout_secs ({}) must be shorter than check_interval_secs ({})",
                self.probe_timeout_secs, self.check_interval_secs
            )));
        }

        if self.backoff_base_secs > self.backoff_ceiling_secs {
            return Err(GuardianError::Config(format!(
                "supervisor.backoff_base_secs ({}) exceeds backoff_ceiling_secs ({})",
                self.backoff_base_secs, self.backoff_ceiling_secs
            )));
        }

        Ok(())
    }
}

fn default_check_interval_secs() -> u64 { 60 }
fn default_max_no_response_secs() -> u64 { 300 }
fn default_failure_threshold() -> u32 { 3 }
fn default_max_restarts() -> u32 { 10 }
fn default_restart_window_secs() -> u64 { 3600 }
fn default_startup_grace_secs() -> u64 { 15 }
fn default_termination_grace_secs() -> u64 { 10 }
fn default_probe_timeout_secs() -> u64 { 10 }
fn default_backoff_base_secs() -> u64 { 2 }
fn default_backoff_ceiling_secs() -> u64 { 300 }
fn default_max_spawn_attempts() -> u32 { 3 }

/// The supervised trading bot process
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WorkerConfig {
    /// Executable to run
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the worker
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Append worker stdout/stderr here instead of inheriting the guardian's
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// HTTP health/status endpoint
    #[serde(default = "default_health_url")]
    pub health_url: String,
    /// JSON field holding the last-decision timestamp
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
}

impl WorkerConfig {
    /// Minimal worker config for a program with default health settings
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            log_file: None,
            health_url: default_health_url(),
            timestamp_field: default_timestamp_field(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(GuardianError::Config("worker.program is required".to_string()));
        }

        let url = url::Url::parse(&self.health_url).map_err(|e| {
            GuardianError::Config(format!("worker.health_url `{}`: {}", self.health_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GuardianError::Config(format!(
                "worker.health_url must be http(s), got `{}`",
                url.scheme()
            )));
        }

        if self.timestamp_field.is_empty() {
            return Err(GuardianError::Config(
                "worker.timestamp_field must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_health_url() -> String { "http://localhost:8080/api/health".to_string() }
fn default_timestamp_field() -> String { "last_update".to_string() }

/// Log output settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also append plain-text logs here
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Parsed max level, falling back to INFO
    pub fn max_level(&self) -> tracing::Level {
        self.level.parse().unwrap_or(tracing::Level::INFO)
    }
}

fn default_log_level() -> String { "info".to_string() }
