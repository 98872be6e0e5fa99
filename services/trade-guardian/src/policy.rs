//! Restart policy - pure evaluation of one observation
//!
//! `evaluate` maps (state, observation, now) to (next state, decision)
//! without touching processes, sockets or the clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SupervisorConfig;
use crate::ledger::RestartLedger;
use crate::types::{Decision, HaltReason, Observation, RestartTrigger, SupervisorPhase};

/// Everything the decision logic remembers between ticks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorState {
    pub phase: SupervisorPhase,
    pub ledger: RestartLedger,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self {
            phase: SupervisorPhase::Starting,
            ledger: RestartLedger::new(),
        }
    }
}

/// Thresholds taken from `SupervisorConfig`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub failure_threshold: u32,
    pub max_no_response_secs: u64,
    pub max_restarts: u32,
    pub restart_window: chrono::Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            max_no_response_secs: config.max_no_response_secs,
            max_restarts: config.max_restarts,
            restart_window: config.restart_window(),
        }
    }

    /// Decide what to do about one observation.
    ///
    /// Staleness and unreachability feed the same failure streak. A process
    /// exit bypasses the streak. Any restart-eligible outcome turns into
    /// `Halt` once the window's restart budget is spent.
    pub fn evaluate(
        &self,
        state: &SupervisorState,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> (SupervisorState, Decision) {
        let mut next = state.clone();
        next.ledger.roll_window(now, self.restart_window);

        let trigger = match observation {
            Observation::Exited(_) => {
                next.ledger.reset_failures();
                RestartTrigger::ProcessExit
            }
            Observation::Probed(sample) if sample.is_healthy(self.max_no_response_secs) => {
                next.ledger.reset_failures();
                next.phase = SupervisorPhase::Healthy;
                return (next, Decision::Continue);
            }
            Observation::Probed(sample) => {
                let streak = next.ledger.record_failure();
                if streak < self.failure_threshold {
                    next.phase = SupervisorPhase::Degraded;
                    return (next, Decision::Continue);
                }
                next.ledger.reset_failures();
                if sample.reachable {
                    RestartTrigger::StaleDecision
                } else {
                    RestartTrigger::Unreachable
                }
            }
        };

        if self.budget_exhausted(&next.ledger) {
            next.phase = SupervisorPhase::Halted;
            (next, Decision::Halt(HaltReason::RestartBudgetExhausted))
        } else {
            next.phase = SupervisorPhase::Restarting;
            (next, Decision::Restart(trigger))
        }
    }

    pub fn budget_exhausted(&self, ledger: &RestartLedger) -> bool {
        ledger.restarts_in_window() >= self.max_restarts
    }
}

/// Delay before the next restart: the exponent is the number of restarts
/// already taken in the current window.
pub fn restart_delay(config: &SupervisorConfig, ledger: &RestartLedger) -> Duration {
    config.backoff().delay(ledger.restarts_in_window())
}
