//! Bounded retry of a single remote operation.
//!
//! Only failures classified as transient are re-attempted. A fatal failure
//! is returned on the spot, and running out of attempts returns the last
//! error tagged with the number of attempts made.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Classify, ErrorClass};

/// Retry policy for remote operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds (0 disables backoff)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    2
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Fatal failure on the given attempt; not retried
    Fatal { attempt: u32, error: E },

    /// Every attempt failed transiently
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempt, .. } => *attempt,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal { error, .. } => error,
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// Successful result plus the attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Policy with no delay between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<Attempted<T>, RetryError<E>>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match operation().await {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    })
                }
                Err(error) => error,
            };

            if error.class() == ErrorClass::Fatal {
                return Err(RetryError::Fatal { attempt, error });
            }

            if !self.should_retry(attempt) {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
