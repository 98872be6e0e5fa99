//! State Management - event journal and status snapshot for operators
//!
//! Layout under the configured state directory:
//! - `state/status.json` - latest supervisor status, rewritten every tick
//! - `journal/events.jsonl` - one JSON line per state transition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::ledger::RestartLedger;
use crate::types::{ExitInfo, GuardianError, HaltReason, HealthSample, Result, SupervisorPhase, WorkerHandle};

const STATUS_FILE: &str = "status.json";
const EVENTS_FILE: &str = "events.jsonl";

/// Writes the journal and status files
pub struct Journal {
    state_dir: PathBuf,
    journal_dir: PathBuf,
}

/// One line in `journal/events.jsonl`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub event_type: EventType,
    pub phase: SupervisorPhase,
    pub worker: Option<WorkerHandle>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkerStarted,
    Tick,
    RestartTriggered,
    WorkerRestarted,
    Halted,
    Stopped,
}

/// Current status (`state/status.json`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub phase: SupervisorPhase,
    pub worker: Option<WorkerHandle>,
    pub ledger: RestartLedger,
    pub last_sample: Option<HealthSample>,
    pub last_exit: Option<ExitInfo>,
    pub halt_reason: Option<HaltReason>,
    pub stats: SessionStats,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStats {
    pub probes: u64,
    pub failed_probes: u64,
    pub worker_exits: u64,
}

impl Journal {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            state_dir: base_dir.join("state"),
            journal_dir: base_dir.join("journal"),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        fs::create_dir_all(&self.journal_dir).await?;
        Ok(())
    }

    pub fn status_path(&self) -> PathBuf {
        self.state_dir.join(STATUS_FILE)
    }

    pub fn events_path(&self) -> PathBuf {
        self.journal_dir.join(EVENTS_FILE)
    }

    /// Replace `state/status.json` via write-then-rename
    pub async fn write_status(&self, status: &StatusSnapshot) -> Result<()> {
        let path = self.status_path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(status)
            .map_err(|e| GuardianError::Journal(format!("serialize status: {}", e)))?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    pub async fn append(&self, event: &JournalEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)
            .map_err(|e| GuardianError::Journal(format!("serialize event: {}", e)))?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every journaled event, oldest first
    pub async fn read_events(&self) -> Result<Vec<JournalEvent>> {
        let content = match fs::read_to_string(self.events_path()).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| GuardianError::Journal(format!("corrupt journal line: {}", e)))
            })
            .collect()
    }

    pub async fn read_status(&self) -> Result<StatusSnapshot> {
        let content = fs::read_to_string(self.status_path()).await?;
        serde_json::from_str(&content)
            .map_err(|e| GuardianError::Journal(format!("corrupt status file: {}", e)))
    }
}
