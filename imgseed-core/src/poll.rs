//! Bounded wait-and-recheck for conditions the kernel settles asynchronously.
//!
//! Loop devices and device-mapper partition nodes show up some time after the
//! command that requested them returns. Instead of sleeping a fixed amount,
//! callers describe how long they are willing to wait with a [`PollPolicy`]
//! and hand [`poll_until`] a probe.

use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::{BuildError, Result};

/// How many times to probe, and how long to wait between probes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PollPolicy {
    /// Total number of probes, including the first one. Never less than 1.
    pub attempts: u32,
    /// Delay before the second probe.
    pub interval: Duration,
    /// Multiplier applied to the delay after every failed probe.
    pub factor: f64,
    /// Upper bound for a single delay.
    pub max_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 8,
            interval: Duration::from_millis(250),
            factor: 2.0,
            max_interval: Duration::from_secs(4),
        }
    }
}

impl PollPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval,
            ..Self::default()
        }
    }

    /// A policy that probes exactly once. Handy in tests.
    pub fn immediate() -> Self {
        Self {
            attempts: 1,
            interval: Duration::ZERO,
            factor: 1.0,
            max_interval: Duration::ZERO,
        }
    }

    /// Delay to wait after the probe numbered `attempt` (0-based) fails.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let scaled = self.interval.as_secs_f64() * self.factor.max(1.0).powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_interval.as_secs_f64()))
    }
}

/// Runs `probe` until it yields a value or the policy is exhausted.
///
/// `probe` returns `Ok(Some(_))` when the condition holds, `Ok(None)` to keep
/// waiting, and `Err(_)` to abort immediately. When every attempt comes back
/// empty the result is [`BuildError::ResourceNotFound`] naming `what`.
pub fn poll_until<T, F>(policy: &PollPolicy, what: &str, mut probe: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let attempts = policy.attempts.max(1);
    for attempt in 0..attempts {
        if let Some(value) = probe()? {
            if attempt > 0 {
                debug!(what, attempt = attempt + 1, "condition met after waiting");
            }
            return Ok(value);
        }
        if attempt + 1 < attempts {
            let delay = policy.delay_after(attempt);
            debug!(what, attempt = attempt + 1, ?delay, "not yet available, waiting");
            thread::sleep(delay);
        }
    }
    Err(BuildError::ResourceNotFound {
        what: what.to_string(),
        attempts,
    })
}
