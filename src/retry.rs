// Transport-level retry with exponential backoff.
// Wraps a single API call; auth failures are never retried.

use std::future::Future;
use std::time::Duration;

use tracing::info;

use crate::error::{Result, WeCareError};

/// How many times, and how patiently, to retry a failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Decide whether a call that failed on `attempt` (1-based) may be tried again.
pub fn should_retry(error: &WeCareError, attempt: u32, max_retries: u32) -> bool {
    if attempt > max_retries {
        return false;
    }

    if error.is_auth_error() {
        return false;
    }

    error.is_network_error() || error.is_server_error()
}

/// Exponential delay before retrying after `attempt`, without jitter.
pub fn backoff_delay(attempt: u32, base_delay: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    base_delay.saturating_mul(1 << exponent)
}

/// Exponential delay plus up to 10% random jitter.
pub fn retry_delay(attempt: u32, base_delay: Duration) -> Duration {
    let delay = backoff_delay(attempt, base_delay);
    let jitter = rand::random::<f64>() * 0.1;
    delay + delay.mul_f64(jitter)
}

/// Run `operation` under `policy`, returning the last error once retries run out.
pub async fn with_retry<T, F, Fut>(operation: F, policy: &RetryPolicy) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_notify(operation, policy, |_, _, _| {}).await
}

/// Like [`with_retry`], calling `on_retry(error, attempt, max_retries)` before each wait.
pub async fn with_retry_notify<T, F, Fut, N>(
    mut operation: F,
    policy: &RetryPolicy,
    mut on_retry: N,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(&WeCareError, u32, u32),
{
    let mut attempt = 1;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !should_retry(&error, attempt, policy.max_retries) {
            return Err(error);
        }

        on_retry(&error, attempt, policy.max_retries);
        let delay = retry_delay(attempt, policy.base_delay);
        info!(
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying request"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
