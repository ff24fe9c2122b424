// SPDX-License-Identifier: MIT

//! Retry with exponential backoff and jitter for remote calls
//!
//! Every error from the wrapped operation counts as retryable. The wait
//! before retry `n` (0-based) is `min(base * 2^n, max_wait)` scaled by a
//! random factor in `[1.0, 1.1]`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use super::error::{BackendError, TaskError};

/// The operation failed on every allowed attempt
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryExhausted<E> {
    /// Number of times the operation was invoked
    pub attempts: u32,
    /// Error returned by the final attempt
    pub last: E,
}

impl From<RetryExhausted<BackendError>> for TaskError {
    fn from(err: RetryExhausted<BackendError>) -> Self {
        TaskError::RetryExhausted {
            attempts: err.attempts,
            last: err.last,
        }
    }
}

/// Bounded retry policy shared by every remote call a task makes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, initial call included
    pub max_attempts: u32,
    /// Wait before the first retry
    pub base_wait: Duration,
    /// Cap applied before jitter
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt cap and wait ceiling
    pub fn new(max_attempts: u32, max_wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            max_wait,
            ..Default::default()
        }
    }

    /// Set the wait before the first retry
    pub fn with_base_wait(mut self, base: Duration) -> Self {
        self.base_wait = base;
        self
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Backoff before jitter for the given 0-based retry number
    pub fn wait_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.base_wait.saturating_mul(multiplier).min(self.max_wait)
    }

    fn jittered(wait: Duration) -> Duration {
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..=0.1);
        wait.mul_f64(factor)
    }

    /// Run `op` until it succeeds or the attempt cap is reached
    pub async fn execute<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt + 1 >= max_attempts {
                        log::error!("{} failed after {} attempts: {}", label, max_attempts, e);
                        return Err(RetryExhausted {
                            attempts: attempt + 1,
                            last: e,
                        });
                    }

                    let wait = Self::jittered(self.wait_for_attempt(attempt));
                    attempt += 1;
                    log::warn!(
                        "{} failed (attempt {}/{}), retrying in {:.1}s: {}",
                        label,
                        attempt,
                        max_attempts,
                        wait.as_secs_f64(),
                        e
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
