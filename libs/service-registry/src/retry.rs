//! Bounded retry around remote operations.
//!
//! A [`RetryPolicy`] runs one logical operation up to `max_attempts` times,
//! sleeping between attempts according to its [`Backoff`]. Only errors for
//! which [`RegistryError::is_retryable`] holds are retried; anything else is
//! returned on the spot. Exhaustion wraps the last failure in
//! [`RegistryError::RetriesExhausted`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use registry_config::{BackoffKind, ReconnectConfig, RetryConfig};

use crate::error::{RegistryError, RegistryResult};

/// Default maximum attempts for a single remote operation.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `base * 2^(n-1)` after the n-th failure, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => base
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
                .min(max),
        }
    }

    /// [`Backoff::delay`] scaled by a random factor in `[0.5, 1.0]`, so that
    /// many instances losing the ensemble together do not reconnect in lockstep.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        let delay = self.delay(attempt);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
    }
}

impl From<&ReconnectConfig> for Backoff {
    fn from(cfg: &ReconnectConfig) -> Self {
        Backoff::Exponential {
            base: cfg.base_delay,
            max: cfg.max_delay,
        }
    }
}

/// Retry policy for remote operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_secs(5),
            },
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        let backoff = match cfg.backoff {
            BackoffKind::Fixed => Backoff::Fixed(cfg.base_delay),
            BackoffKind::Exponential => Backoff::Exponential {
                base: cfg.base_delay,
                max: cfg.max_delay,
            },
        };
        Self {
            max_attempts: cfg.max_attempts.get(),
            backoff,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails fatally, exhausts the policy, or
    /// `cancel` fires. Cancellation also interrupts an in-flight attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RegistryResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RegistryError::Cancelled);
            }
            attempt += 1;

            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
                res = op() => res,
            };

            let err = match res {
                Ok(val) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(val);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                error!(
                    attempts = attempt,
                    error = %err,
                    "operation failed after all retry attempts"
                );
                return Err(RegistryError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.backoff.delay(attempt);
            let retry_in_ms = delay.as_millis();
            if err.is_conflict() {
                // another writer moved the node
                debug!(attempt, retry_in_ms, error = %err, "node changed underneath, retrying");
            } else {
                warn!(
                    attempt,
                    max_attempts,
                    retry_in_ms,
                    error = %err,
                    "operation failed, retrying"
                );
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
