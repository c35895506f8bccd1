//! Bounded retry with exponential backoff
//!
//! Only network and destination-store calls go through here. The wrapped
//! operation decides what is worth retrying via [`IngestError::is_retryable`].

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

/// Default number of attempts (including the first)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt; doubles for every later attempt
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay slept after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Run `operation` until it succeeds, fails permanently, or the attempt
    /// budget is spent. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            debug!(operation = what, attempt, max_attempts = self.max_attempts, "Attempting");

            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && e.is_retryable() => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        operation = what,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(give_up(what, attempt, e)),
            }
        }
    }
}

fn give_up(what: &str, attempt: u32, error: IngestError) -> IngestError {
    if attempt > 1 {
        warn!(operation = what, attempts = attempt, error = %error, "Giving up");
    }
    error
}
