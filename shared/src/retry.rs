//! Bounded retry with exponential backoff for calls to Google APIs.
//!
//! Each attempt runs under its own deadline. Transient failures (see
//! [`Error::is_transient`]) are retried after 1s, 2s, 4s, ... capped at
//! `max_delay`; anything else is returned immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::{Error, Result};

/// How many times and how patiently to call a remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Deadline for each attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(5);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `call` until it succeeds, fails permanently, or retries run out.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying remote call"
            );
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(policy.attempt_timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_transient() => {
                warn!(operation, attempt, error = %e, "Transient failure");
                last_err = Some(e);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(operation, attempt, "Attempt timed out");
                last_err = Some(Error::Timeout(format!(
                    "{} exceeded {:?}",
                    operation, policy.attempt_timeout
                )));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Internal(format!("{} failed after retries", operation))))
}
