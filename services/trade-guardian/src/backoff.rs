//! Exponential backoff shared by restart delays and spawn retries

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::{sleep_or_stop, Clock};

/// `base * multiplier^attempt`, capped at `ceiling`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    multiplier: u32,
    ceiling: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, multiplier: u32, ceiling: Duration) -> Self {
        Self {
            base,
            multiplier: multiplier.max(1),
            ceiling: ceiling.max(base),
        }
    }

    /// Delay before attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = (self.multiplier as u64).saturating_pow(attempt);
        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.ceiling)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

/// Run `op` up to `max_attempts` times, sleeping `policy.delay(n)` on `clock`
/// between failures. Returns the last error when every attempt fails, and
/// `Ok(None)` once a stop is requested: no further attempt or sleep runs.
pub async fn retry<T, E, F, Fut>(
    policy: &BackoffPolicy,
    max_attempts: u32,
    clock: &dyn Clock,
    shutdown: &watch::Receiver<bool>,
    label: &str,
    mut op: F,
) -> Result<Option<T>, E>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if *shutdown.borrow() {
            info!("{} abandoned: stop requested", label);
            return Ok(None);
        }

        match op(attempt).await {
            Ok(value) => return Ok(Some(value)),
            Err(e) if attempt + 1 >= max_attempts => {
                warn!("{} failed after {} attempts: {}", label, max_attempts, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {} - retrying in {:?}",
                    label,
                    attempt + 1,
                    max_attempts,
                    e,
                    delay
                );
                if sleep_or_stop(clock, delay, shutdown).await {
                    info!("{} abandoned: stop requested", label);
                    return Ok(None);
                }
                attempt += 1;
                debug!("{} retry attempt {}", label, attempt + 1);
            }
        }
    }
}
