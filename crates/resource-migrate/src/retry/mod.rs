//! Retry policy with capped, jittered exponential backoff.
//!
//! Every retried operation walks the state machine
//! `Idle -> Attempting -> (Success | RetryScheduled -> Attempting | Exhausted)`.
//! Only errors for which [`MigrateError::is_retryable`] holds are retried;
//! everything else ends the operation on the attempt that produced it.

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Phase of a single retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Idle,
    Attempting,
    RetryScheduled,
    Success,
    Exhausted,
}

/// Per-operation retry bookkeeping. Lives only as long as the operation.
#[derive(Debug)]
pub struct RetryState {
    pub phase: RetryPhase,
    /// Attempts started so far.
    pub attempt: u32,
    /// Delay that will be slept before the next attempt.
    pub next_delay: Duration,
    /// Summary of the error that triggered the most recent retry.
    pub last_error: Option<String>,
    started: Instant,
}

impl RetryState {
    fn new() -> Self {
        Self {
            phase: RetryPhase::Idle,
            attempt: 0,
            next_delay: Duration::ZERO,
            last_error: None,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Outcome of a retried operation together with the attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Backoff parameters shared by every caller.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Total time an operation may spend retrying.
    pub max_elapsed: Duration,
    /// Add up to 50% random jitter to each computed delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            max_elapsed: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Build the policy from migration settings.
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            base_delay: config.base_backoff(),
            max_delay: config.max_backoff(),
            max_attempts: config.max_attempts.max(1),
            max_elapsed: config.max_retry_elapsed(),
            jitter: true,
        }
    }

    /// Policy that never sleeps; used by dry runs and tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: max_attempts.max(1),
            max_elapsed: Duration::from_secs(3600),
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (1-based), before jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Delay before retry number `retry`, jittered within `[backoff, 1.5 * backoff]`
    /// and capped. Doubling keeps the sequence non-decreasing despite jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = base.as_millis() as u64 / 2;
        let extra = rand::thread_rng().gen_range(0..=spread);
        (base + Duration::from_millis(extra)).min(self.max_delay)
    }

    /// The full delay sequence an operation can go through.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(move |retry| self.delay_for(retry))
    }

    /// Run `op` until it succeeds, fails terminally, or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number. A server-provided
    /// `retry_after` replaces the computed delay for that retry.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryState::new();

        loop {
            state.attempt += 1;
            state.phase = RetryPhase::Attempting;

            let err = match op(state.attempt).await {
                Ok(value) => {
                    state.phase = RetryPhase::Success;
                    if state.attempt > 1 {
                        debug!("{}: succeeded on attempt {}", operation, state.attempt);
                    }
                    return Attempted {
                        result: Ok(value),
                        attempts: state.attempt,
                    };
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Attempted {
                    result: Err(err),
                    attempts: state.attempt,
                };
            }

            let computed = self.delay_for(state.attempt).max(state.next_delay);
            let delay = err.retry_after().unwrap_or(computed);
            let over_time = state.elapsed() + delay > self.max_elapsed;

            if state.attempt >= self.max_attempts || over_time {
                state.phase = RetryPhase::Exhausted;
                warn!(
                    "{}: giving up after {} attempts ({:.1}s): {}",
                    operation,
                    state.attempt,
                    state.elapsed().as_secs_f64(),
                    err
                );
                return Attempted {
                    result: Err(MigrateError::Exhausted {
                        attempts: state.attempt,
                        last: Box::new(err),
                    }),
                    attempts: state.attempt,
                };
            }

            state.phase = RetryPhase::RetryScheduled;
            state.next_delay = computed;
            state.last_error = Some(err.to_string());
            debug!(
                "{}: attempt {} failed ({}), retrying in {}ms",
                operation,
                state.attempt,
                err,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Like [`run`](Self::run) but discards the attempt count.
    pub async fn call<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, op).await.result
    }
}
