//! Retry policy for activity dispatch.
//!
//! A policy is recorded on the `TaskScheduled` event so the dispatcher (and recovery
//! after a restart) applies the same attempts and backoff the orchestrator asked for.
//! Intermediate attempts never touch history.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay schedule between failed attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt-1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Delay to wait after the given (1-based) failed attempt before the next one.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let factor = multiplier.powi(attempt as i32 - 1);
                let millis = base.as_millis() as f64 * factor;
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis as u64).min(*max)
                }
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

/// Attempts, backoff and per-attempt timeout for one activity call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Per-attempt timeout; an attempt that exceeds it counts as a failure.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` and the default exponential backoff.
    ///
    /// Panics if `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::None,
            timeout: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether another attempt is allowed after `attempt` failed attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
