//! Eventual consistency helpers for live cloud checks.
//!
//! Resources reported as created by the IaC tool are not always settled:
//! instances may still be `modifying` or `backing-up`, and describe calls
//! may briefly return stale data. These helpers poll with exponential
//! backoff until a condition holds.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Upper bound for a single backoff step.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Categories of eventual consistency with documented SLAs.
#[derive(Debug, Clone, Copy)]
pub enum ConsistencyCategory {
    /// Describe calls reflecting a completed apply (60s)
    ApiPropagation,

    /// Database and cache instances settling to `available` (10min)
    ResourceStatus,

    /// Resources disappearing after destroy (5min)
    Teardown,
}

impl ConsistencyCategory {
    /// Get the maximum timeout for this consistency category.
    pub fn timeout(&self) -> Duration {
        match self {
            ConsistencyCategory::ApiPropagation => Duration::from_secs(60),
            ConsistencyCategory::ResourceStatus => Duration::from_secs(600),
            ConsistencyCategory::Teardown => Duration::from_secs(300),
        }
    }

    fn initial_delay(&self) -> Duration {
        match self {
            ConsistencyCategory::ApiPropagation => Duration::from_secs(1),
            ConsistencyCategory::ResourceStatus | ConsistencyCategory::Teardown => {
                Duration::from_secs(5)
            }
        }
    }
}

/// Assert that a condition becomes true within the timeout for the given
/// consistency category.
///
/// Backoff starts at the category's initial delay, doubles after every
/// miss, and is capped at 30s and at the remaining time.
///
/// # Example
///
/// ```no_run
/// use env_tests::eventual::{assert_eventually, ConsistencyCategory};
///
/// # async fn db_status() -> String { String::new() }
/// # async fn example() {
/// assert_eventually(ConsistencyCategory::ResourceStatus, || async {
///     db_status().await == "available"
/// })
/// .await
/// .expect("database should become available");
/// # }
/// ```
pub async fn assert_eventually<F, Fut>(
    category: ConsistencyCategory,
    mut condition: F,
) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let timeout = category.timeout();
    let mut delay = category.initial_delay();
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if condition().await {
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(format!(
                "Condition not met within {timeout:?} after {attempts} attempts (category: {category:?})"
            ));
        }

        let remaining = timeout.saturating_sub(elapsed);
        sleep(delay.min(remaining)).await;
        delay = (delay * 2).min(MAX_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_consistency_category_timeouts() {
        assert_eq!(
            ConsistencyCategory::ApiPropagation.timeout(),
            Duration::from_secs(60)
        );
        assert_eq!(
            ConsistencyCategory::ResourceStatus.timeout(),
            Duration::from_secs(600)
        );
        assert_eq!(
            ConsistencyCategory::Teardown.timeout(),
            Duration::from_secs(300)
        );
    }

    #[tokio::test]
    async fn test_assert_eventually_succeeds_immediately() {
        let result =
            assert_eventually(ConsistencyCategory::ApiPropagation, || async { true }).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_assert_eventually_succeeds_after_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = assert_eventually(ConsistencyCategory::ResourceStatus, move || {
            let attempts = attempts_clone.clone();
            async move { attempts.fetch_add(1, Ordering::SeqCst) + 1 >= 3 }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assert_eventually_fails_on_timeout() {
        let start = Instant::now();
        let result =
            assert_eventually(ConsistencyCategory::ApiPropagation, || async { false }).await;

        let err = result.expect_err("Should return error on timeout");
        assert!(err.contains("not met within"));
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(61));
    }
}
