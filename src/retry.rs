//! Retry policy for reconnect attempts and connection waits.
//!
//! The contract is "retry forever": a policy only shapes the delays between
//! attempts, it never gives up. The default is the fixed one-second rhythm;
//! a capped exponential curve can be configured without changing callers.

use crate::config::duration_secs;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delays used while waiting out an outage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Wake-up granularity for callers blocked on the connected signal.
    /// Default: 1s
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    /// Delay after a failed connect attempt.
    /// Default: 1s
    #[serde(with = "duration_secs")]
    pub backoff: Duration,

    /// Upper bound for the connect delay when `multiplier` grows it.
    /// Default: 1s
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,

    /// Growth per consecutive failed attempt (1.0 = fixed).
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Same delay for polling and for every reconnect attempt.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            poll_interval: interval,
            backoff: interval,
            max_backoff: interval,
            multiplier: 1.0,
        }
    }

    /// Doubling reconnect delay starting at `base`, capped at `max`.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            poll_interval: base,
            backoff: base,
            max_backoff: max.max(base),
            multiplier: 2.0,
        }
    }

    /// Builder: set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Delay before reconnect attempt `attempt + 1` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let cap = self.max_backoff.max(self.backoff).as_secs_f64();
        let secs = (self.backoff.as_secs_f64() * factor).min(cap);
        Duration::from_secs_f64(secs)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".into()));
        }
        if !self.multiplier.is_finite() {
            return Err(Error::Config(format!(
                "backoff multiplier must be finite, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}
