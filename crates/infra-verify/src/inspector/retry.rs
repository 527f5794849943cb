//! Bounded exponential backoff for cloud reads.
//!
//! Strategy:
//! - Initial delay: `RetryPolicy::initial_delay`
//! - Exponential multiplier: 2x
//! - Maximum attempts: `RetryPolicy::max_attempts` (first call included)
//! - Overall budget: `RetryPolicy::timeout`, including time spent in calls
//!
//! Only errors with [`VerifyError::is_retryable`] are retried.

use crate::config::RetryPolicy;
use crate::errors::{Result, VerifyError};
use std::future::Future;
use tokio::time::{sleep, Instant};
use tracing::warn;

/// Run `call` until it succeeds, fails permanently, or the policy is spent.
///
/// When attempts or time run out the last transient error is returned.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut delay = policy.initial_delay;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let remaining = policy.timeout.saturating_sub(start.elapsed());
        let result = match tokio::time::timeout(remaining, call()).await {
            Ok(result) => result,
            Err(_) => {
                return Err(VerifyError::TransientApi(format!(
                    "{operation} did not complete within {:?} ({attempt} attempts)",
                    policy.timeout
                )));
            }
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        if attempt >= policy.max_attempts {
            return Err(err);
        }

        let remaining = policy.timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(err);
        }

        warn!(
            target: "infra_verify.inspector",
            operation = %operation,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = u64::try_from(delay.min(remaining).as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Transient cloud API error, retrying"
        );

        sleep(delay.min(remaining)).await;

        delay = delay.saturating_mul(2);
    }
}
