use std::time::Duration;

use crate::config::RetryCfg;
use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// The n-th retry waits `n * base_delay`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryCfg::default())
    }
}

impl From<&RetryCfg> for RetryPolicy {
    fn from(cfg: &RetryCfg) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting,
    RetryWait,
    Success,
    Failed,
}

impl RetryState {
    pub fn is_final(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { delay: Duration },
    Fail,
}

/// Tracks attempts of one session and decides what follows a failure.
#[derive(Debug)]
pub struct RetrySupervisor {
    policy: RetryPolicy,
    state: RetryState,
    retry_count: u32,
    attempts: u32,
}

impl RetrySupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Attempting,
            retry_count: 0,
            attempts: 0,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Connection attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start the next attempt. Leaves `RetryWait` once the backoff has elapsed.
    pub fn begin_attempt(&mut self) -> u32 {
        debug_assert!(!self.state.is_final(), "attempt after {:?}", self.state);
        self.state = RetryState::Attempting;
        self.attempts += 1;
        self.attempts
    }

    /// Decide what follows a failed attempt.
    ///
    /// Only zero-byte connection failures are retried; once an attempt has
    /// delivered anything, a retry would duplicate output for the caller.
    pub fn on_failure(&mut self, err: &RelayError, bytes_delivered: u64) -> Decision {
        let retryable = err.is_retryable() && bytes_delivered == 0;
        if retryable && self.retry_count < self.policy.max_retries {
            self.retry_count += 1;
            self.state = RetryState::RetryWait;
            return Decision::Retry {
                delay: self.policy.base_delay.saturating_mul(self.retry_count),
            };
        }
        self.state = RetryState::Failed;
        Decision::Fail
    }

    pub fn on_success(&mut self) {
        self.state = RetryState::Success;
    }

    /// Terminate without a further attempt (internal fault, cancellation).
    pub fn abort(&mut self) {
        if !self.state.is_final() {
            self.state = RetryState::Failed;
        }
    }
}
