use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::TransferError;

/// Bounded retry with a randomized delay between attempts.
///
/// Only errors for which [`TransferError::is_transient`] holds are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Lower bound of the delay before a retry.
    pub min_delay: Duration,
    /// Upper bound of the delay before a retry.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Retries immediately; used where waiting would only slow tests down.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Picks a delay uniformly from `[min_delay, max_delay]`.
    pub fn delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = (self.max_delay.as_millis() as u64).max(min);
        if min == max {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Returns `true` if `err` on attempt `attempt` (1-based) should be
    /// followed by another attempt.
    pub fn should_retry(&self, attempt: u32, err: &TransferError) -> bool {
        attempt < self.max_attempts.max(1) && err.is_transient()
    }

    /// Runs `op` until it succeeds, fails with a non-transient error or
    /// runs out of attempts. `op` receives the attempt number.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, TransferError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt, &e) => {
                    let delay = self.delay();
                    warn!(
                        operation = what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
