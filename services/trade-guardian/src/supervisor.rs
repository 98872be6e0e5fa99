//! Supervisor - main watchdog loop
//!
//! Keeps exactly one worker alive: spawn, startup grace, then one probe and
//! one evaluation per tick, with at most one restart per tick. Halts when the
//! restart budget for the rolling window is spent.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::retry;
use crate::clock::{sleep_or_stop, Clock, SystemClock};
use crate::config::{GuardianConfig, SupervisorConfig};
use crate::journal::{EventType, Journal, JournalEvent, SessionStats, StatusSnapshot};
use crate::policy::{restart_delay, RestartPolicy, SupervisorState};
use crate::probe::{HealthProbe, HttpHealthProbe};
use crate::process::{CommandLauncher, Termination, WorkerLauncher, WorkerProcess};
use crate::types::{
    Decision, ExitInfo, HaltReason, HealthSample, Observation, Outcome, RestartTrigger, Result,
    SupervisorPhase, WorkerHandle,
};

/// Log a healthy tick at INFO once every this many healthy ticks
const HEARTBEAT_EVERY_TICKS: u64 = 10;

/// The current worker: its handle plus the process behind it
struct CurrentWorker {
    handle: WorkerHandle,
    process: Box<dyn WorkerProcess>,
}

/// How a restart attempt ended
enum RestartResult {
    Restarted,
    Stopped,
    Halted(HaltReason),
}

/// Process-health supervisor for one worker
pub struct Supervisor {
    config: SupervisorConfig,
    policy: RestartPolicy,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    journal: Option<Journal>,
    shutdown: watch::Receiver<bool>,
    session_id: Uuid,
    state: SupervisorState,
    current: Option<CurrentWorker>,
    last_worker: Option<WorkerHandle>,
    generation: u32,
    last_sample: Option<HealthSample>,
    last_exit: Option<ExitInfo>,
    halt_reason: Option<HaltReason>,
    stats: SessionStats,
    healthy_ticks: u64,
}

impl Supervisor {
    /// Create a supervisor from its collaborators
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn HealthProbe>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            policy: RestartPolicy::from_config(&config),
            config,
            launcher,
            probe,
            clock,
            journal: None,
            shutdown,
            session_id: Uuid::new_v4(),
            state: SupervisorState::default(),
            current: None,
            last_worker: None,
            generation: 0,
            last_sample: None,
            last_exit: None,
            halt_reason: None,
            stats: SessionStats::default(),
            healthy_ticks: 0,
        }
    }

    /// Production wiring: OS process, HTTP probe, system clock
    pub fn from_config(config: &GuardianConfig, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let launcher = Arc::new(CommandLauncher::new(config.worker.clone()));
        let probe = Arc::new(HttpHealthProbe::new(
            &config.worker,
            config.supervisor.probe_timeout(),
        )?);

        let supervisor = Self::new(
            config.supervisor,
            launcher,
            probe,
            Arc::new(SystemClock),
            shutdown,
        );

        Ok(match &config.state_dir {
            Some(dir) => supervisor.with_journal(Journal::new(dir)),
            None => supervisor,
        })
    }

    /// Record transitions and status under a state directory
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.state.phase
    }

    /// Handle of the worker currently considered live
    pub fn current_worker(&self) -> Option<WorkerHandle> {
        self.current.as_ref().map(|c| c.handle)
    }

    /// Run until stopped or halted.
    ///
    /// Errors only when the very first worker cannot be spawned; everything
    /// after that is absorbed into decisions.
    pub async fn run(mut self) -> Result<Outcome> {
        info!("============================================================");
        info!("Trade guardian starting (session {})", self.session_id);
        info!(
            "Check interval: {}s, max no-response: {}s, failure threshold: {}, max restarts: {}/{}s",
            self.config.check_interval_secs,
            self.config.max_no_response_secs,
            self.config.failure_threshold,
            self.config.max_restarts,
            self.config.restart_window_secs
        );
        info!("============================================================");

        if let Some(journal) = &self.journal {
            journal.init().await?;
        }

        match self.start().await {
            Ok(true) => {}
            Ok(false) => return Ok(self.stop().await),
            Err(e) => {
                error!("Initial worker start failed: {}", e);
                return Err(e);
            }
        }
        if self.wait_or_stop(self.config.startup_grace()).await {
            return Ok(self.stop().await);
        }

        loop {
            let observation = self.observe().await;

            // A stop that arrived mid-probe is honoured before acting on the result
            if self.stop_requested() {
                return Ok(self.stop().await);
            }

            let now = self.clock.now();
            let (next, decision) = self.policy.evaluate(&self.state, &observation, now);
            self.state = next;
            self.record_tick(&observation, decision).await;

            match decision {
                Decision::Continue => {}
                Decision::Restart(trigger) => match self.restart(trigger).await {
                    RestartResult::Restarted => {}
                    RestartResult::Stopped => return Ok(self.stop().await),
                    RestartResult::Halted(reason) => return Ok(self.halt(reason).await),
                },
                Decision::Halt(reason) => return Ok(self.halt(reason).await),
            }

            if self.wait_or_stop(self.config.check_interval()).await {
                return Ok(self.stop().await);
            }
        }
    }

    /// Spawn a worker (retrying with backoff) and install it as current.
    /// `Ok(false)` when a stop arrived before a worker could be spawned.
    async fn start(&mut self) -> Result<bool> {
        self.state.phase = SupervisorPhase::Starting;

        let launcher = Arc::clone(&self.launcher);
        let spawned = retry(
            &self.config.backoff(),
            self.config.max_spawn_attempts,
            self.clock.as_ref(),
            &self.shutdown,
            "Worker spawn",
            |_| launcher.spawn(),
        )
        .await?;
        let Some(process) = spawned else {
            return Ok(false);
        };

        self.generation += 1;
        let handle = WorkerHandle {
            pid: process.pid(),
            started_at: self.clock.now(),
            generation: self.generation,
        };
        self.current = Some(CurrentWorker { handle, process });
        self.last_worker = Some(handle);

        info!(
            "Worker started ({}), waiting {}s before first health check",
            handle, self.config.startup_grace_secs
        );
        self.emit(
            EventType::WorkerStarted,
            format!("worker started ({})", handle),
            None,
        )
        .await;
        self.write_status().await;
        Ok(true)
    }

    /// Probe the current worker. An exit seen before or right after the
    /// probe wins over the probe result.
    async fn observe(&mut self) -> Observation {
        if let Some(exit) = self.check_exit() {
            return Observation::Exited(exit);
        }

        let sample = self.probe.probe(self.clock.now()).await;

        if let Some(exit) = self.check_exit() {
            return Observation::Exited(exit);
        }
        Observation::Probed(sample)
    }

    /// Liveness check; retires the current handle once the process is gone
    fn check_exit(&mut self) -> Option<ExitInfo> {
        let current = self.current.as_mut()?;
        let exit = current.process.try_exit()?;
        error!("Worker {} exited: {}", current.handle, exit);
        self.current = None;
        self.last_exit = Some(exit.clone());
        Some(exit)
    }

    async fn record_tick(&mut self, observation: &Observation, decision: Decision) {
        let streak = self.state.ledger.consecutive_failures();
        let threshold = self.config.failure_threshold;

        let (message, metadata) = match observation {
            Observation::Exited(exit) => {
                self.stats.worker_exits += 1;
                (
                    format!("worker exited: {}", exit),
                    json!({ "exit": exit }),
                )
            }
            Observation::Probed(sample) => {
                self.stats.probes += 1;
                let healthy = sample.is_healthy(self.config.max_no_response_secs);
                let message = if healthy {
                    self.healthy_ticks += 1;
                    if self.healthy_ticks % HEARTBEAT_EVERY_TICKS == 0 {
                        info!(
                            "Worker healthy ({} consecutive healthy checks)",
                            self.healthy_ticks
                        );
                    }
                    debug!(
                        "Health check passed ✓ (decision age: {:?}s)",
                        sample.decision_age_secs
                    );
                    "healthy".to_string()
                } else {
                    self.stats.failed_probes += 1;
                    self.healthy_ticks = 0;
                    let cause = if sample.reachable {
                        format!(
                            "stale decision: last decision {}s ago (limit {}s)",
                            sample.decision_age_secs.unwrap_or_default(),
                            self.config.max_no_response_secs
                        )
                    } else {
                        format!(
                            "unreachable: {}",
                            sample.error.as_deref().unwrap_or("no detail")
                        )
                    };
                    if decision == Decision::Continue {
                        warn!("Health check failed ({}/{}): {}", streak, threshold, cause);
                    }
                    cause
                };
                self.last_sample = Some(sample.clone());
                (message, json!({ "sample": sample, "consecutive_failures": streak }))
            }
        };

        self.emit(EventType::Tick, message, Some(metadata)).await;
        self.write_status().await;
    }

    /// Retire the current worker, back off, and start a replacement
    async fn restart(&mut self, trigger: RestartTrigger) -> RestartResult {
        error!(
            "Restart triggered by {} (restarts in window: {}/{})",
            trigger,
            self.state.ledger.restarts_in_window(),
            self.config.max_restarts
        );
        self.emit(
            EventType::RestartTriggered,
            format!("restart triggered: {}", trigger),
            Some(json!({ "trigger": trigger })),
        )
        .await;

        if let Err(e) = self.retire_current().await {
            error!("Not spawning a replacement while the old worker may be alive: {}", e);
            return RestartResult::Halted(HaltReason::WorkerUnkillable);
        }

        let delay = restart_delay(&self.config, &self.state.ledger);
        self.state.ledger.record_restart(self.clock.now());
        self.state.phase = SupervisorPhase::Restarting;
        warn!(
            "Restarting worker in {:?} (restart #{} in window, {} total)",
            delay,
            self.state.ledger.restarts_in_window(),
            self.state.ledger.total_restarts()
        );
        self.write_status().await;

        if self.wait_or_stop(delay).await {
            return RestartResult::Stopped;
        }

        match self.start().await {
            Ok(true) => {}
            Ok(false) => return RestartResult::Stopped,
            Err(e) => {
                error!("Could not respawn worker: {}", e);
                return RestartResult::Halted(HaltReason::SpawnFailed);
            }
        }

        self.emit(
            EventType::WorkerRestarted,
            format!("worker restarted after {:?} backoff", delay),
            Some(json!({
                "trigger": trigger,
                "backoff_secs": delay.as_secs(),
                "restarts_in_window": self.state.ledger.restarts_in_window(),
            })),
        )
        .await;

        if self.wait_or_stop(self.config.startup_grace()).await {
            return RestartResult::Stopped;
        }
        RestartResult::Restarted
    }

    /// Terminate the current worker and clear the handle before anything new
    /// is spawned. Falls back to a kill when the graceful path errors; if
    /// that fails too, the worker stays current and the error is returned.
    async fn retire_current(&mut self) -> Result<()> {
        let Some(mut current) = self.current.take() else {
            return Ok(());
        };

        let terminated = current
            .process
            .terminate(self.config.termination_grace())
            .await;
        let exit = match terminated {
            Ok(Termination::Killed(exit)) => {
                warn!("Worker {} force-killed ({})", current.handle, exit);
                exit
            }
            Ok(termination) => {
                info!("Worker {} stopped ({})", current.handle, termination.exit());
                termination.exit().clone()
            }
            Err(e) => {
                warn!("Failed to stop worker {}: {}, killing", current.handle, e);
                match current.process.kill().await {
                    Ok(exit) => {
                        warn!("Worker {} force-killed ({})", current.handle, exit);
                        exit
                    }
                    Err(kill_err) => {
                        error!(
                            "Worker {} could not be killed and may still be running: {}",
                            current.handle, kill_err
                        );
                        self.current = Some(current);
                        return Err(kill_err);
                    }
                }
            }
        };

        self.last_exit = Some(exit);
        Ok(())
    }

    /// Stop supervising and leave the worker exactly as it is
    async fn halt(&mut self, reason: HaltReason) -> Outcome {
        self.state.phase = SupervisorPhase::Halted;
        self.halt_reason = Some(reason);
        let worker = self.current.as_ref().map(|c| c.handle);

        error!("============================================================");
        error!("GUARDIAN HALTED: {}", reason);
        error!(
            "Restarts in window: {}/{} (window opened {:?}), total restarts: {}",
            self.state.ledger.restarts_in_window(),
            self.config.max_restarts,
            self.state.ledger.window_started_at(),
            self.state.ledger.total_restarts()
        );
        match (worker, &self.last_exit) {
            (Some(handle), _) => error!("Worker {} left running in its current state", handle),
            (None, Some(exit)) => error!("No live worker; last exit: {}", exit),
            (None, None) => error!("No live worker"),
        }
        if let Some(sample) = &self.last_sample {
            error!("Last health sample: {:?}", sample);
        }
        error!("Automatic recovery stopped - manual intervention required");
        error!("============================================================");

        self.emit(
            EventType::Halted,
            format!("halted: {}", reason),
            Some(json!({ "reason": reason, "ledger": self.state.ledger })),
        )
        .await;
        self.write_status().await;

        Outcome::Halted {
            reason,
            last_worker: worker.or(self.last_worker),
        }
    }

    /// Operator stop: terminate the worker gracefully, then return
    async fn stop(&mut self) -> Outcome {
        info!("Stop requested, shutting down worker...");
        if self.retire_current().await.is_err() {
            return self.halt(HaltReason::WorkerUnkillable).await;
        }
        self.state.phase = SupervisorPhase::Stopped;

        self.emit(EventType::Stopped, "guardian stopped".to_string(), None)
            .await;
        self.write_status().await;
        info!("Trade guardian stopped");
        Outcome::Stopped
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep on the clock; returns true as soon as a stop is requested
    async fn wait_or_stop(&self, duration: Duration) -> bool {
        sleep_or_stop(self.clock.as_ref(), duration, &self.shutdown).await
    }

    async fn emit(
        &self,
        event_type: EventType,
        message: String,
        metadata: Option<serde_json::Value>,
    ) {
        let Some(journal) = &self.journal else {
            return;
        };
        let event = JournalEvent {
            timestamp: self.clock.now(),
            session_id: self.session_id,
            event_type,
            phase: self.state.phase,
            worker: self.current.as_ref().map(|c| c.handle),
            message,
            metadata,
        };
        if let Err(e) = journal.append(&event).await {
            warn!("Failed to journal {:?} event: {}", event_type, e);
        }
    }

    async fn write_status(&self) {
        let Some(journal) = &self.journal else {
            return;
        };
        let status = StatusSnapshot {
            timestamp: self.clock.now(),
            session_id: self.session_id,
            phase: self.state.phase,
            worker: self.current.as_ref().map(|c| c.handle),
            ledger: self.state.ledger.clone(),
            last_sample: self.last_sample.clone(),
            last_exit: self.last_exit.clone(),
            halt_reason: self.halt_reason,
            stats: self.stats,
        };
        if let Err(e) = journal.write_status(&status).await {
            warn!("Failed to write status snapshot: {}", e);
        }
    }
}
