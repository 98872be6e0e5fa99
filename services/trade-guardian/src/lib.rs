//! Trade Guardian Library
//!
//! Process-health supervisor for the trading bot worker: spawns it, probes
//! its health endpoint, restarts it with backoff and halts for an operator
//! once the restart budget is spent.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod journal;
pub mod ledger;
pub mod policy;
pub mod probe;
pub mod process;
pub mod supervisor;
pub mod types;

// Re-export main types for convenience
pub use backoff::{retry, BackoffPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GuardianConfig, LoggingConfig, SupervisorConfig, WorkerConfig};
pub use journal::{EventType, Journal, JournalEvent, SessionStats, StatusSnapshot};
pub use ledger::RestartLedger;
pub use policy::{restart_delay, RestartPolicy, SupervisorState};
pub use probe::{HealthProbe, HttpHealthProbe};
pub use process::{CommandLauncher, Termination, WorkerLauncher, WorkerProcess};
pub use supervisor::Supervisor;
pub use types::{
    Decision, ExitInfo, GuardianError, HaltReason, HealthSample, Observation, Outcome,
    RestartTrigger, Result, SupervisorPhase, WorkerHandle,
};
