use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Errors that know whether another attempt could help.
pub trait Classify {
    fn is_retryable(&self) -> bool;
}

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay every time.
    Fixed,
    /// base * failures
    Linear,
    /// base * 2^(failures - 1)
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per item, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Ceiling for a single wait.
    pub max_delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 30_000,
            backoff: Backoff::Exponential,
        }
    }
}

/// Result of a unit of work that did not fail fatally.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last_error: E },
}

impl RetryPolicy {
    /// Retries without waiting.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff: Backoff::Fixed,
        }
    }

    /// Wait after the `failures`-th retryable failure (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let n = failures.max(1);
        let ms = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Linear => self.base_delay_ms.saturating_mul(u64::from(n)),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(n - 1).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Run `work` until it succeeds, fails fatally, or runs out of attempts.
    ///
    /// `work` receives the 1-based attempt number. Fatal errors come back as
    /// `Err` right away without consuming further attempts; retryable ones
    /// end in [`RetryOutcome::Exhausted`] once `max_attempts` is reached.
    pub async fn attempt<T, E, F, Fut>(&self, label: &str, mut work: F) -> Result<RetryOutcome<T, E>, E>
    where
        E: Classify + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match work(attempt).await {
                Ok(value) => {
                    return Ok(RetryOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    })
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max => {
                    return Ok(RetryOutcome::Exhausted {
                        attempts: attempt,
                        last_error: e,
                    })
                }
                Err(e) => {
                    let backoff = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; backing off {:.1}s",
                        label,
                        attempt,
                        max,
                        e,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
