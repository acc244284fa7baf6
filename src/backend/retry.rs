use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Per-request deadline plus bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base, 2x base, 4x base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out. Each attempt is bounded by the policy timeout; an
/// elapsed deadline counts as [`Error::BackendUnavailable`].
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::BackendUnavailable(format!(
                "{label} timed out after {:?}",
                policy.timeout
            ))),
        };
        match outcome {
            Ok(val) => return Ok(val),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let wait = policy.backoff(attempt);
                log::warn!(
                    "{label} failed ({e}). Waiting {wait:?} before retry {}/{}",
                    attempt + 1,
                    attempts - 1
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
