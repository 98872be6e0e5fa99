//! End-to-end supervisor test harness
//!
//! Drives the full loop against scripted workers and a virtual clock:
//! spawn → grace → probe → evaluate → restart/halt/stop → journal


use chrono::{DateTime, TimeZone, Utc};
use mock_worker::{MockLauncher, MockProbe, MockWorld, ProbeStep, SpawnStep, SIGKILL, SIGTERM};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use trade_guardian::{
    EventType, ExitInfo, GuardianError, HaltReason, Journal, ManualClock, Outcome,
    RestartTrigger, Supervisor, SupervisorConfig, SupervisorPhase,
};

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 7, 0, 0).unwrap()
}

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|s| Duration::from_secs(*s)).collect()
}

struct Harness {
    world: Arc<MockWorld>,
    clock: ManualClock,
    supervisor: Supervisor,
}

fn harness(config: SupervisorConfig) -> Harness {
    let world = MockWorld::new();
    let clock = ManualClock::new(start_time());
    let (tx, rx) = watch::channel(false);
    world.set_stop_sender(tx);

    let supervisor = Supervisor::new(
        config,
        Arc::new(MockLauncher(Arc::clone(&world))),
        Arc::new(MockProbe(Arc::clone(&world))),
        Arc::new(clock.clone()),
        rx,
    );

    Harness {
        world,
        clock,
        supervisor,
    }
}

/// Small budget so restart-limit scenarios stay short
fn tight_config() -> SupervisorConfig {
    SupervisorConfig {
        failure_threshold: 1,
        max_restarts: 2,
        ..SupervisorConfig::default()
    }
}

fn exit_code(code: i32) -> ExitInfo {
    ExitInfo {
        code: Some(code),
        signal: None,
    }
}

#[tokio::test]
async fn test_healthy_worker_is_left_alone() {
    let h = harness(SupervisorConfig::default());
    h.world.plan_probes(vec![ProbeStep::Healthy; 5]);

    let outcome = h.supervisor.run().await.unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(h.world.spawn_attempts(), 1);
    assert_eq!(h.world.probes(), 6);
    // startup grace, then one interval after each healthy tick
    assert_eq!(h.clock.sleeps(), secs(&[15, 60, 60, 60, 60, 60]));

    let processes = h.world.processes();
    assert_eq!(processes[0].terminations, 1);
    assert_eq!(
        processes[0].exit,
        Some(ExitInfo {
            code: None,
            signal: Some(SIGTERM)
        })
    );
}

#[tokio::test]
async fn test_unreachable_worker_restarted_after_threshold() {
    let h = harness(SupervisorConfig::default());
    h.world.plan_probes(vec![ProbeStep::Unreachable; 3]);

    let outcome = h.supervisor.run().await.unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(h.world.spawn_attempts(), 2);
    // grace, two failed ticks, 2s backoff, grace for the replacement, interval
    assert_eq!(h.clock.sleeps(), secs(&[15, 60, 60, 2, 15, 60]));

    let processes = h.world.processes();
    assert_eq!(processes.len(), 2);
    assert_eq!(processes[0].terminations, 1);
    assert_eq!(processes[1].terminations, 1);
    assert_eq!(h.world.live_workers(), 0);
}

#[tokio::test]
async fn test_two_failures_then_recovery_does_not_restart() {
    let h = harness(SupervisorConfig::default());
    h.world.plan_probes(vec![
        ProbeStep::Unreachable,
        ProbeStep::Unreachable,
        ProbeStep::Healthy,
        ProbeStep::Unreachable,
        ProbeStep::Stale(400),
    ]);

    let outcome = h.supervisor.run().await.unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(h.world.spawn_attempts(), 1);
}

#[tokio::test]
async fn test_stale_decisions_trigger_restart() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(SupervisorConfig::default());
    let supervisor = h.supervisor.with_journal(Journal::new(dir.path()));
    // Endpoint answers, but the last decision is 310s old every time
    h.world.plan_probes(vec![ProbeStep::Stale(310); 3]);

    let outcome = supervisor.run().await.unwrap();
    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(h.world.spawn_attempts(), 2);

    let journal = Journal::new(dir.path());
    let events = journal.read_events().await.unwrap();
    let triggered: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::RestartTriggered)
        .collect();
    assert_eq!(triggered.len(), 1);
    let trigger = &triggered[0].metadata.as_ref().unwrap()["trigger"];
    assert_eq!(
        trigger,
        &serde_json::to_value(RestartTrigger::StaleDecision).unwrap()
    );
}

#[tokio::test]
async fn test_restart_budget_exhausted_halts_and_leaves_worker() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(tight_config());
    let supervisor = h.supervisor.with_journal(Journal::new(dir.path()));
    h.world.plan_probes(vec![ProbeStep::Unreachable; 3]);

    let outcome = supervisor.run().await.unwrap();

    let Outcome::Halted {
        reason,
        last_worker,
    } = outcome
    else {
        panic!("expected halt, got {:?}", outcome);
    };
    assert_eq!(reason, HaltReason::RestartBudgetExhausted);
    let last_worker = last_worker.unwrap();
    assert_eq!(last_worker.generation, 3);
    assert_eq!(last_worker.pid, 1002);

    // No probe after the halt, and no stop request either
    assert_eq!(h.world.probes(), 3);
    assert_eq!(h.world.spawn_attempts(), 3);

    // The last worker is untouched
    let processes = h.world.processes();
    assert_eq!(processes[2].terminations, 0);
    assert!(processes[2].exit.is_none());

    // Backoff doubles between restarts
    assert_eq!(h.clock.sleeps(), secs(&[15, 2, 15, 60, 4, 15, 60]));

    let journal = Journal::new(dir.path());
    let status = journal.read_status().await.unwrap();
    assert_eq!(status.phase, SupervisorPhase::Halted);
    assert_eq!(status.halt_reason, Some(HaltReason::RestartBudgetExhausted));
    assert_eq!(status.ledger.restarts_in_window(), 2);
    assert_eq!(status.worker.map(|w| w.generation), Some(3));

    let events = journal.read_events().await.unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::Halted);
}

#[tokio::test]
async fn test_restart_window_rolls_over() {
    let dir = tempfile::tempdir().unwrap();
    let config = SupervisorConfig {
        restart_window_secs: 300,
        ..tight_config()
    };
    let h = harness(config);
    let supervisor = h.supervisor.with_journal(Journal::new(dir.path()));

    let mut probes = vec![ProbeStep::Unreachable, ProbeStep::Unreachable];
    probes.extend(vec![ProbeStep::Healthy; 5]);
    // Budget would be spent, but the window opened more than 300s ago
    probes.push(ProbeStep::Unreachable);
    h.world.plan_probes(probes);

    let outcome = supervisor.run().await.unwrap();
    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(h.world.spawn_attempts(), 4);

    // Fresh window restarts the backoff from the base delay
    let sleeps = h.clock.sleeps();
    assert_eq!(sleeps[sleeps.len() - 3], Duration::from_secs(2));

    let status = Journal::new(dir.path()).read_status().await.unwrap();
    assert_eq!(status.phase, SupervisorPhase::Stopped);
    assert_eq!(status.ledger.total_restarts(), 3);
    assert_eq!(status.ledger.restarts_in_window(), 1);
}

#[tokio::test]
async fn test_exit_during_probe_beats_probe_result() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(SupervisorConfig::default());
    let supervisor = h.supervisor.with_journal(Journal::new(dir.path()));
    h.world.plan_probes(vec![ProbeStep::WorkerExits(exit_code(1))]);

    let outcome = supervisor.run().await.unwrap();
    assert_eq!(outcome, Outcome::Stopped);

    // One restart, no threshold wait, and no signal sent to the dead worker
    assert_eq!(h.world.spawn_attempts(), 2);
    let processes = h.world.processes();
    assert_eq!(processes[0].terminations, 0);
    assert_eq!(processes[0].exit, Some(exit_code(1)));
    assert_eq!(h.clock.sleeps(), secs(&[15, 2, 15, 60]));

    let journal = Journal::new(dir.path());
    let events = journal.read_events().await.unwrap();
    let triggered = events
        .iter()
        .find(|e| e.event_type == EventType::RestartTriggered)
        .unwrap();
    assert_eq!(
        triggered.metadata.as_ref().unwrap()["trigger"],
        serde_json::to_value(RestartTrigger::ProcessExit).unwrap()
    );

    let status = journal.read_status().await.unwrap();
    assert_eq!(status.stats.worker_exits, 1);
    assert_eq!(status.stats.probes, 0);
}

#[tokio::test]
async fn test_dead_worker_detected_without_probing() {
    let h = harness(SupervisorConfig::default());
    h.world.plan_spawns(vec![SpawnStep::ExitsImmediately(exit_code(2))]);

    let outcome = h.supervisor.run().await.unwrap();
    assert_eq!(outcome, Outcome::Stopped);

    // First tick never probes the dead worker; second tick is the stop
    assert_eq!(h.world.probes(), 1);
    assert_eq!(h.world.spawn_attempts(), 2);
}

#[tokio::test]
async fn test_initial_spawn_failure_is_an_error() {
    let h = harness(SupervisorConfig::default());
    h.world
        .plan_spawns(vec![SpawnStep::Fail, SpawnStep::Fail, SpawnStep::Fail]);

    let err = h.supervisor.run().await.unwrap_err();

    assert!(matches!(err, GuardianError::Spawn { .. }), "{}", err);
    assert_eq!(h.world.spawn_attempts(), 3);
    assert_eq!(h.world.probes(), 0);
    // Retry delays between the three attempts
    assert_eq!(h.clock.sleeps(), secs(&[2, 4]));
}

#[tokio::test]
async fn test_initial_spawn_retry_succeeds() {
    let h = harness(SupervisorConfig::default());
    h.world.plan_spawns(vec![SpawnStep::Fail]);
    h.world.plan_probes(vec![ProbeStep::Healthy]);

    let outcome = h.supervisor.run().await.unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(h.world.spawn_attempts(), 2);
    // Generation counts successful spawns only
    assert_eq!(h.world.processes().len(), 1);
    assert_eq!(h.clock.sleeps(), secs(&[2, 15, 60]));
}

#[tokio::test]
async fn test_respawn_failure_halts() {
    let h = harness(tight_config());
    h.world.plan_spawns(vec![
        SpawnStep::Succeed,
        SpawnStep::Fail,
        SpawnStep::Fail,
        SpawnStep::Fail,
    ]);
    h.world.plan_probes(vec![ProbeStep::Unreachable]);

    let outcome = h.supervisor.run().await.unwrap();

    match outcome {
        Outcome::Halted {
            reason,
            last_worker,
        } => {
            assert_eq!(reason, HaltReason::SpawnFailed);
            assert_eq!(last_worker.map(|w| w.generation), Some(1));
        }
        other => panic!("expected halt, got {:?}", other),
    }
    assert_eq!(h.world.spawn_attempts(), 4);
    assert_eq!(h.world.live_workers(), 0);
}

#[tokio::test]
async fn test_stop_during_startup_grace_terminates_worker() {
    let h = harness(SupervisorConfig::default());
    h.world.plan_spawns(vec![SpawnStep::SucceedWithStop]);

    let outcome = h.supervisor.run().await.unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(h.world.probes(), 0);
    assert_eq!(h.world.processes()[0].terminations, 1);
    assert!(h.clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_stop_before_start_spawns_nothing() {
    let h = harness(SupervisorConfig::default());
    h.world
        .plan_spawns(vec![SpawnStep::Fail, SpawnStep::Fail, SpawnStep::Succeed]);
    h.world.stop();

    let outcome = h.supervisor.run().await.unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(h.world.spawn_attempts(), 0);
    assert!(h.world.processes().is_empty());
    assert!(h.clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_stop_during_spawn_retries_skips_remaining_backoff() {
    let h = harness(SupervisorConfig {
        max_spawn_attempts: 10,
        ..SupervisorConfig::default()
    });
    h.world.plan_spawns(vec![
        SpawnStep::Fail,
        SpawnStep::FailWithStop,
        SpawnStep::Succeed,
    ]);

    let outcome = h.supervisor.run().await.unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(h.world.spawn_attempts(), 2);
    assert!(h.world.processes().is_empty());
    // Only the backoff before the stop arrived
    assert_eq!(h.clock.sleeps(), secs(&[2]));
}

#[tokio::test]
async fn test_stop_during_respawn_retries() {
    let h = harness(tight_config());
    h.world.plan_spawns(vec![SpawnStep::Succeed, SpawnStep::FailWithStop]);
    h.world.plan_probes(vec![ProbeStep::Unreachable]);

    let outcome = h.supervisor.run().await.unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(h.world.spawn_attempts(), 2);
    assert_eq!(h.world.live_workers(), 0);
    // grace, restart backoff, and nothing after the failed respawn
    assert_eq!(h.clock.sleeps(), secs(&[15, 2]));
}

#[tokio::test]
async fn test_worker_refusing_sigterm_is_killed_before_replacement() {
    let h = harness(SupervisorConfig::default());
    h.world.workers_refuse_terminate();
    h.world.plan_probes(vec![ProbeStep::Unreachable; 3]);

    let outcome = h.supervisor.run().await.unwrap();

    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(h.world.spawn_attempts(), 2);
    assert_eq!(h.world.peak_live(), 1);
    assert_eq!(h.world.live_workers(), 0);

    let processes = h.world.processes();
    assert_eq!(processes[0].kills, 1);
    assert_eq!(processes[1].kills, 1);
    assert_eq!(
        processes[0].exit,
        Some(ExitInfo {
            code: None,
            signal: Some(SIGKILL)
        })
    );
}

#[tokio::test]
async fn test_unkillable_worker_halts_instead_of_respawning() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(SupervisorConfig::default());
    let supervisor = h.supervisor.with_journal(Journal::new(dir.path()));
    h.world.workers_refuse_terminate();
    h.world.workers_survive_kill();
    h.world.plan_probes(vec![ProbeStep::Unreachable; 3]);

    let outcome = supervisor.run().await.unwrap();

    match outcome {
        Outcome::Halted {
            reason,
            last_worker,
        } => {
            assert_eq!(reason, HaltReason::WorkerUnkillable);
            let survivor = last_worker.unwrap();
            assert_eq!(survivor.pid, 1000);
            assert_eq!(survivor.generation, 1);
        }
        other => panic!("expected halt, got {:?}", other),
    }
    assert_eq!(h.world.spawn_attempts(), 1);
    assert_eq!(h.world.peak_live(), 1);
    assert_eq!(h.world.live_workers(), 1);

    let status = Journal::new(dir.path()).read_status().await.unwrap();
    assert_eq!(status.phase, SupervisorPhase::Halted);
    assert_eq!(status.halt_reason, Some(HaltReason::WorkerUnkillable));
    assert_eq!(status.worker.map(|w| w.pid), Some(1000));
    // The restart never happened
    assert_eq!(status.ledger.total_restarts(), 0);
}

#[tokio::test]
async fn test_unkillable_worker_on_stop_is_reported() {
    let h = harness(SupervisorConfig::default());
    h.world.workers_refuse_terminate();
    h.world.workers_survive_kill();

    // First probe carries the stop request
    let outcome = h.supervisor.run().await.unwrap();

    let Outcome::Halted {
        reason,
        last_worker,
    } = outcome
    else {
        panic!("expected halt, got {:?}", outcome);
    };
    assert_eq!(reason, HaltReason::WorkerUnkillable);
    assert_eq!(last_worker.map(|w| w.pid), Some(1000));
    assert_eq!(h.world.live_workers(), 1);
    assert_eq!(h.world.processes()[0].kills, 1);
}

#[tokio::test]
async fn test_worker_ignoring_sigterm_is_killed_on_restart() {
    let h = harness(tight_config());
    h.world.workers_ignore_sigterm();
    h.world.plan_probes(vec![ProbeStep::Unreachable]);

    let outcome = h.supervisor.run().await.unwrap();
    assert_eq!(outcome, Outcome::Stopped);

    let processes = h.world.processes();
    assert_eq!(processes.len(), 2);
    assert_eq!(
        processes[0].exit,
        Some(ExitInfo {
            code: None,
            signal: Some(SIGKILL)
        })
    );
    // At most one worker at a time
    assert_eq!(h.world.live_workers(), 0);
}

#[tokio::test]
async fn test_journal_records_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(SupervisorConfig::default());
    let session_id = h.supervisor.session_id();
    let supervisor = h.supervisor.with_journal(Journal::new(dir.path()));
    h.world.plan_probes(vec![ProbeStep::Unreachable; 3]);

    supervisor.run().await.unwrap();

    let journal = Journal::new(dir.path());
    let kinds: Vec<EventType> = journal
        .read_events()
        .await
        .unwrap()
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventType::WorkerStarted,
            EventType::Tick,
            EventType::Tick,
            EventType::Tick,
            EventType::RestartTriggered,
            EventType::WorkerStarted,
            EventType::WorkerRestarted,
            EventType::Stopped,
        ]
    );

    let status = journal.read_status().await.unwrap();
    assert_eq!(status.session_id, session_id);
    assert_eq!(status.phase, SupervisorPhase::Stopped);
    assert_eq!(status.stats.probes, 3);
    assert_eq!(status.stats.failed_probes, 3);
    assert_eq!(status.ledger.total_restarts(), 1);
    assert!(status.worker.is_none());
    assert!(status.timestamp > start_time());
}
