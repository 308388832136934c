//! Same-model retry with exponential backoff.
//!
//! A model is called until it succeeds, fails with a terminal error, or
//! uses up `max_retries` retries. The caller decides what happens next
//! (fall back to another model or give up).

use std::future::Future;
use std::time::Duration;

use crate::config::RouterConfig;
use crate::provider::ProviderError;

/// Longest single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// Bound on each individual call.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: config.backoff_base(),
            attempt_timeout: config.attempt_timeout(),
        }
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// `base * 2^(retry-1)`, raised to the provider's retry-after hint when
    /// larger, and never above 8s.
    pub fn backoff(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exp);
        delay.max(retry_after.unwrap_or_default()).min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

/// Result of driving one model to success or give-up.
#[derive(Debug)]
pub struct ModelAttempts<T> {
    pub result: Result<T, ProviderError>,
    /// Calls made, including the first.
    pub attempts: u32,
}

/// Call `send` until success, a terminal error, or retries run out.
///
/// Each call is bounded by `policy.attempt_timeout`; overrunning it counts
/// as a `Timeout` failure.
pub async fn retry_model<T, F, Fut>(policy: &RetryPolicy, model: &str, send: F) -> ModelAttempts<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.attempt_timeout, send()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(format!(
                "Model '{}' did not finish within {:?}",
                model, policy.attempt_timeout
            ))),
        };

        let err = match result {
            Ok(value) => {
                return ModelAttempts {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => err,
        };

        tracing::warn!(
            model = %model,
            kind = %err.kind,
            attempt,
            error = %err.message,
            "Attempt failed"
        );

        if !err.kind.is_retryable() || attempt > policy.max_retries {
            return ModelAttempts {
                result: Err(err),
                attempts: attempt,
            };
        }

        let delay = policy.backoff(attempt, err.retry_after);
        tracing::debug!(model = %model, delay_ms = delay.as_millis() as u64, "Backing off before retry");
        tokio::time::sleep(delay).await;
    }
}
