//! Exponential back-off with full jitter for failing receive calls.
//!
//! The ceiling doubles from `base` up to `cap`; the actual delay is drawn
//! uniformly from `[0, ceiling]`.

use std::time::Duration;

use binding::RetryPolicy;
use rand::Rng;

/// Back-off configuration for a loop's receive calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Ceiling after the first failure.
    pub base: Duration,
    /// Largest ceiling.
    pub cap: Duration,
    /// Consecutive failures after which the loop reports itself fatal.
    pub escalate_after: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            escalate_after: 10,
        }
    }
}

/// Tracks consecutive failures and computes the next delay.
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    consecutive_failures: u32,
}

impl BackoffState {
    /// Creates a fresh back-off state.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
        }
    }

    /// Records a successful call, resetting the sequence.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Records a failure and returns the jittered delay before the next attempt.
    ///
    /// `floor` raises the delay to at least a provider-requested value.
    pub fn record_failure(&mut self, floor: Option<Duration>) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let ceiling = self.ceiling();
        let jittered = if ceiling.is_zero() {
            Duration::ZERO
        } else {
            let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
            Duration::from_millis(millis)
        };
        match floor {
            Some(floor) => jittered.max(floor.min(self.config.cap)),
            None => jittered,
        }
    }

    /// Records a failure classified by `policy` and returns the delay.
    ///
    /// Both policies stay on the same schedule; a retryable error may raise
    /// the floor with a provider-requested delay.
    pub fn record_policy(&mut self, policy: &RetryPolicy) -> Duration {
        match policy {
            RetryPolicy::Retryable { after } => self.record_failure(*after),
            RetryPolicy::NonRetryable => self.record_failure(None),
        }
    }

    /// Upper bound of the delay for the current failure count.
    pub fn ceiling(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (self.consecutive_failures - 1).min(31);
        self.config
            .base
            .checked_mul(1u32 << exponent)
            .map_or(self.config.cap, |d| d.min(self.config.cap))
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// `true` once the failure count has reached the escalation threshold.
    pub fn is_escalated(&self) -> bool {
        self.consecutive_failures >= self.config.escalate_after
    }
}
