//! Restart ledger - failure streak and rolling-window restart budget

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Counters owned by the supervisor loop
///
/// The window opens with the first restart after a quiet period and closes
/// once `window` has elapsed since then; closing resets the windowed count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartLedger {
    consecutive_failures: u32,
    restarts_in_window: u32,
    window_started_at: Option<DateTime<Utc>>,
    total_restarts: u64,
}

impl RestartLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the window if it has elapsed. Returns true when counts were reset.
    pub fn roll_window(&mut self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.window_started_at {
            Some(started) if now - started >= window => {
                self.restarts_in_window = 0;
                self.window_started_at = None;
                true
            }
            _ => false,
        }
    }

    /// Count one failed probe, returning the new streak length
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count one restart, opening a window if none is active
    pub fn record_restart(&mut self, now: DateTime<Utc>) {
        if self.window_started_at.is_none() {
            self.window_started_at = Some(now);
        }
        self.restarts_in_window = self.restarts_in_window.saturating_add(1);
        self.total_restarts = self.total_restarts.saturating_add(1);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn restarts_in_window(&self) -> u32 {
        self.restarts_in_window
    }

    pub fn window_started_at(&self) -> Option<DateTime<Utc>> {
        self.window_started_at
    }

    pub fn total_restarts(&self) -> u64 {
        self.total_restarts
    }
}
