//! Worker process lifecycle
//!
//! Spawns the trading bot with `tokio::process::Command` and controls it
//! with SIGTERM/SIGKILL. The supervisor only sees the traits, so tests can
//! substitute scripted processes.

use async_trait::async_trait;
use std::fs::OpenOptions;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::types::{ExitInfo, GuardianError, Result};

/// Starts new worker instances
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn spawn(&self) -> Result<Box<dyn WorkerProcess>>;
}

/// A running (or recently exited) worker instance
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> u32;

    /// Non-blocking liveness check; `Some` once the process has exited
    fn try_exit(&mut self) -> Option<ExitInfo>;

    /// Graceful stop: SIGTERM, wait up to `grace`, then SIGKILL
    async fn terminate(&mut self, grace: Duration) -> Result<Termination>;

    /// SIGKILL and reap; `Ok` only once the process is confirmed gone
    async fn kill(&mut self) -> Result<ExitInfo>;
}

/// How a termination request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Process was already gone before the signal
    AlreadyExited(ExitInfo),
    /// Exited within the grace period
    Graceful(ExitInfo),
    /// Grace period elapsed; force-killed
    Killed(ExitInfo),
}

impl Termination {
    pub fn exit(&self) -> &ExitInfo {
        match self {
            Termination::AlreadyExited(exit)
            | Termination::Graceful(exit)
            | Termination::Killed(exit) => exit,
        }
    }
}

/// Launches `worker.program` as an OS process
pub struct CommandLauncher {
    worker: WorkerConfig,
}

impl CommandLauncher {
    pub fn new(worker: WorkerConfig) -> Self {
        Self { worker }
    }

    fn build_command(&self) -> Result<Command> {
        let mut cmd = Command::new(&self.worker.program);
        cmd.args(&self.worker.args)
            .envs(&self.worker.env)
            .stdin(Stdio::null())
            .kill_on_drop(false);

        if let Some(dir) = &self.worker.working_dir {
            cmd.current_dir(dir);
        }

        // Worker output is never piped: an unread pipe would eventually block it
        match &self.worker.log_file {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                cmd.stdout(Stdio::from(file.try_clone()?));
                cmd.stderr(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
        }

        Ok(cmd)
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn spawn(&self) -> Result<Box<dyn WorkerProcess>> {
        let mut cmd = self.build_command()?;

        info!(
            "Spawning worker: {} {}",
            self.worker.program,
            self.worker.args.join(" ")
        );

        let child = cmd.spawn().map_err(|source| GuardianError::Spawn {
            program: self.worker.program.clone(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| GuardianError::Spawn {
            program: self.worker.program.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                "process exited before its pid could be read",
            ),
        })?;

        debug!("Worker spawned with pid {}", pid);
        Ok(Box::new(ChildProcess { child, pid }))
    }
}

/// Worker backed by a tokio `Child`
pub struct ChildProcess {
    child: Child,
    pid: u32,
}

impl ChildProcess {
    #[cfg(unix)]
    fn request_stop(&mut self) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            // Exited between the liveness check and the signal
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(GuardianError::Signal {
                pid: self.pid,
                source: std::io::Error::from(errno),
            }),
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self) -> Result<()> {
        self.child.start_kill().map_err(|source| GuardianError::Signal {
            pid: self.pid,
            source,
        })
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> Option<ExitInfo> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(exit_info(status)),
            Ok(None) => None,
            Err(e) => {
                warn!("Liveness check for pid {} failed: {}", self.pid, e);
                None
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Result<Termination> {
        if let Some(exit) = self.try_exit() {
            debug!("Worker pid {} already exited ({})", self.pid, exit);
            return Ok(Termination::AlreadyExited(exit));
        }

        info!("Stopping worker pid {} (grace {:?})", self.pid, grace);
        if let Err(e) = self.request_stop() {
            warn!("SIGTERM to worker pid {} failed ({}), killing", self.pid, e);
            return Ok(Termination::Killed(self.kill().await?));
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let exit = exit_info(status?);
                info!("Worker pid {} terminated gracefully ({})", self.pid, exit);
                Ok(Termination::Graceful(exit))
            }
            Err(_) => {
                warn!(
                    "Worker pid {} ignored SIGTERM for {:?}, killing",
                    self.pid, grace
                );
                Ok(Termination::Killed(self.kill().await?))
            }
        }
    }

    async fn kill(&mut self) -> Result<ExitInfo> {
        self.child.kill().await.map_err(|source| GuardianError::Signal {
            pid: self.pid,
            source,
        })?;
        let exit = exit_info(self.child.wait().await?);
        info!("Worker pid {} force-killed ({})", self.pid, exit);
        Ok(exit)
    }
}

fn exit_info(status: ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
    }
}
