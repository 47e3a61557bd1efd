//! Retry Executor: classification-driven retries with exponential backoff.
//!
//! Rate limits are always retried and honor the server's wait hint verbatim
//! (capped). Service errors are retried only when flagged retryable. Anything
//! else fails on first occurrence. Exhausting the budget hands back the last
//! error unchanged.

#![allow(missing_docs)]

use std::time::Duration;

use rand::Rng;

use crate::core::config::RetryConfig;
use crate::runner::processor::{ProcessError, RetryClass};
use crate::runner::signals::CancelFlag;

/// Fraction of the exponential delay added as random jitter, at most.
const JITTER_RATIO: f64 = 0.10;

/// Pure backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_delay(),
            multiplier: config.multiplier,
            max_delay: config.max_delay(),
            max_retry_after: config.max_retry_after(),
        }
    }
}

impl RetryPolicy {
    /// Total attempts including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based) after `err`, or `None`
    /// when `err` must not be retried.
    #[must_use]
    pub fn next_delay(&self, retry: u32, err: &ProcessError) -> Option<Duration> {
        match err.class() {
            RetryClass::RateLimited {
                retry_after: Some(wait),
            } => Some(wait.min(self.max_retry_after)),
            RetryClass::RateLimited { retry_after: None } | RetryClass::Retryable => {
                Some(self.backoff(retry, rand::rng().random::<f64>()))
            }
            RetryClass::Terminal => None,
        }
    }

    /// `min(initial * multiplier^retry + jitter, max)` with
    /// `jitter = unit * 10%` of the exponential term, `unit` in `[0, 1)`.
    #[must_use]
    pub fn backoff(&self, retry: u32, unit: f64) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let jittered = base + base * JITTER_RATIO * unit.clamp(0.0, 1.0);
        let max = self.max_delay.as_secs_f64();
        if !jittered.is_finite() || jittered >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Result of running one operation under the executor.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Attempts actually made (at least 1).
    pub attempts: u32,
    pub result: Result<T, ProcessError>,
    /// A cancel request cut a backoff wait short.
    pub cancelled: bool,
}

/// Runs operations under a [`RetryPolicy`], sleeping cancellably between
/// attempts.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: CancelFlag,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(policy: RetryPolicy, cancel: CancelFlag) -> Self {
        Self { policy, cancel }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Run `op` until it succeeds, fails terminally, or the budget runs out.
    pub fn run<T, F>(&self, op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Result<T, ProcessError>,
    {
        self.run_observed(op, |_, _, _| {})
    }

    /// Like [`run`](Self::run), calling `on_retry(attempt, delay, err)` before
    /// each backoff wait. `attempt` is the 1-based attempt that just failed.
    pub fn run_observed<T, F, N>(&self, mut op: F, mut on_retry: N) -> Attempted<T>
    where
        F: FnMut(u32) -> Result<T, ProcessError>,
        N: FnMut(u32, Duration, &ProcessError),
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op(attempt) {
                Ok(value) => {
                    return Attempted {
                        attempts: attempt,
                        result: Ok(value),
                        cancelled: false,
                    };
                }
                Err(err) => err,
            };

            let delay = if attempt < max_attempts {
                self.policy.next_delay(attempt - 1, &err)
            } else {
                None
            };
            let Some(delay) = delay else {
                return Attempted {
                    attempts: attempt,
                    result: Err(err),
                    cancelled: false,
                };
            };

            on_retry(attempt, delay, &err);
            if !self.cancel.sleep(delay) {
                return Attempted {
                    attempts: attempt,
                    result: Err(err),
                    cancelled: true,
                };
            }
        }
    }
}
