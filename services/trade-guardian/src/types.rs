//! Core types for worker supervision
//!
//! These types define the contract between the supervisor loop, the health
//! probe and the process layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the running worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    /// OS process identifier
    pub pid: u32,
    /// When this instance was spawned
    pub started_at: DateTime<Utc>,
    /// 1 for the initial spawn, incremented on every restart
    pub generation: u32,
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={} gen={}", self.pid, self.generation)
    }
}

/// How the worker process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal on unix
    pub signal: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "signal {}", sig),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Result of one health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    /// When the probe completed
    pub timestamp: DateTime<Utc>,
    /// Endpoint answered 2xx with a readable payload
    pub reachable: bool,
    /// HTTP status, when a response was received at all
    pub http_status: Option<u16>,
    /// Seconds since the worker's last completed decision cycle
    pub decision_age_secs: Option<i64>,
    /// Transport or payload error detail
    pub error: Option<String>,
}

impl HealthSample {
    /// A reachable sample with an optional decision age
    pub fn reachable(timestamp: DateTime<Utc>, decision_age_secs: Option<i64>) -> Self {
        Self {
            timestamp,
            reachable: true,
            http_status: Some(200),
            decision_age_secs,
            error: None,
        }
    }

    /// An unreachable sample carrying the failure detail
    pub fn unreachable(timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            timestamp,
            reachable: false,
            http_status: None,
            decision_age_secs: None,
            error: Some(error.into()),
        }
    }

    /// Decision age exceeds `max_no_response_secs`
    pub fn is_stale(&self, max_no_response_secs: u64) -> bool {
        let limit = i64::try_from(max_no_response_secs).unwrap_or(i64::MAX);
        matches!(self.decision_age_secs, Some(age) if age > limit)
    }

    /// Reachable and fresh
    pub fn is_healthy(&self, max_no_response_secs: u64) -> bool {
        self.reachable && !self.is_stale(max_no_response_secs)
    }
}

/// What one tick observed about the worker
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Process still running; probe result attached
    Probed(HealthSample),
    /// Process is gone; any probe on the same tick is discarded
    Exited(ExitInfo),
}

/// Why a restart (or halt) was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartTrigger {
    /// Health endpoint could not be reached
    Unreachable,
    /// Last decision is older than `max_no_response`
    StaleDecision,
    /// Worker process exited on its own
    ProcessExit,
}

impl fmt::Display for RestartTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartTrigger::Unreachable => write!(f, "unreachable"),
            RestartTrigger::StaleDecision => write!(f, "stale decision"),
            RestartTrigger::ProcessExit => write!(f, "process exit"),
        }
    }
}

/// Terminal condition requiring an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Restarts in the rolling window reached `max_restarts`
    RestartBudgetExhausted,
    /// A replacement worker could not be spawned
    SpawnFailed,
    /// The current worker survived both SIGTERM and SIGKILL
    WorkerUnkillable,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::RestartBudgetExhausted => write!(f, "restart budget exhausted"),
            HaltReason::SpawnFailed => write!(f, "worker could not be respawned"),
            HaltReason::WorkerUnkillable => write!(f, "worker could not be stopped"),
        }
    }
}

/// Output of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Restart(RestartTrigger),
    Halt(HaltReason),
}

/// Supervisor state machine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    Starting,
    Healthy,
    Degraded,
    Restarting,
    Halted,
    Stopped,
}

impl SupervisorPhase {
    /// No further ticks will run
    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorPhase::Halted | SupervisorPhase::Stopped)
    }
}

/// How `Supervisor::run` ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Operator stop signal; worker terminated
    Stopped,
    /// Automatic recovery gave up; worker left as-is
    Halted {
        reason: HaltReason,
        last_worker: Option<WorkerHandle>,
    },
}

/// Error types for the guardian
#[derive(Debug, thiserror::Error)]
pub enum GuardianError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to spawn worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal worker pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for GuardianError {
    fn from(e: ::config::ConfigError) -> Self {
        GuardianError::Config(e.to_string())
    }
}

/// Result type for guardian operations
pub type Result<T> = std::result::Result<T, GuardianError>;
