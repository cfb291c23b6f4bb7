//! Bounded exponential backoff for a single external call
//!
//! A policy wraps one call, not a whole step. It is rebuilt from step
//! configuration on every tick, so retry behaviour is identical after a
//! restart.

use crate::error::{Result, StepError};
use crucible_control::ControlError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration for one external call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: u32,
    backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, 2)
    }
}

impl RetryPolicy {
    /// Policy with a one-second backoff unit
    ///
    /// `max_attempts` is clamped to at least one call.
    pub fn new(max_attempts: u32, backoff_base: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_unit: Duration::from_secs(1),
        }
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_base(&self) -> u32 {
        self.backoff_base
    }

    pub fn backoff_unit(&self) -> Duration {
        self.backoff_unit
    }

    /// Wait after the `attempt`-th (1-indexed) transient failure
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_base.saturating_pow(attempt);
        self.backoff_unit.saturating_mul(factor)
    }

    /// Run `call`, retrying errors for which [`ControlError::is_transient`]
    /// holds
    pub async fn run<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crucible_control::Result<T>>,
    {
        self.run_when(operation, ControlError::is_transient, call).await
    }

    /// Run `call`, retrying errors accepted by `transient`
    ///
    /// Every transient failure is followed by its backoff wait, the last
    /// one included, so that the next tick does not hit a busy device
    /// straight away. Non-transient errors surface immediately as
    /// [`StepError::Client`]; exhaustion as [`StepError::RetryExhausted`].
    pub async fn run_when<T, F, Fut, P>(
        &self,
        operation: &str,
        transient: P,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crucible_control::Result<T>>,
        P: Fn(&ControlError) -> bool,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation, attempt = attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !transient(&err) {
                return Err(StepError::Client(err));
            }

            let backoff = self.delay_for(attempt);
            warn!(
                operation = operation,
                attempt = attempt,
                max = self.max_attempts,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Transient failure, backing off"
            );
            tokio::time::sleep(backoff).await;

            if attempt >= self.max_attempts {
                return Err(StepError::RetryExhausted {
                    attempts: attempt,
                    max_attempts: self.max_attempts,
                    last: err,
                });
            }
        }
    }
}
