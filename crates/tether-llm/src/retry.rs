//! Rate-limit retry for model calls.
//!
//! Only [`SDKError::RateLimit`] is retried. Every other error is returned on
//! the first failure.

use std::future::Future;
use std::time::Duration;

use crate::errors::SDKError;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn delay_for_attempt_ms(attempt: u32, policy: &RetryPolicy) -> u64 {
    let exp = attempt.saturating_sub(1) as i32;
    let base = (policy.initial_delay_ms as f64) * policy.backoff_factor.powi(exp);
    base.min(policy.max_delay_ms as f64).round().max(0.0) as u64
}

/// Runs `operation` and retries it while it fails with a rate-limit error.
///
/// A provider-supplied `retry-after` wins over the computed backoff when it is
/// longer.
pub async fn retry_rate_limited<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, SDKError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SDKError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_rate_limit() && attempt < policy.max_retries => {
                attempt += 1;
                let mut delay = Duration::from_millis(delay_for_attempt_ms(attempt, policy));
                if let Some(hint) = error.retry_after() {
                    delay = delay.max(hint.min(Duration::from_millis(policy.max_delay_ms)));
                }
                tracing::warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "model call rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}
