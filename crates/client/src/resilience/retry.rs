//! Exponential backoff with jitter.
//!
//! `delay(i) = min(initial * 2^i, max)`, then jitter of `delay * factor * U(-1, 1)`
//! is added and the result floored at zero (whole milliseconds).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use ripfetch_core::{AppConfig, ClassifiedError};

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (default: 3)
    pub max_retries: u32,
    /// Base delay before the first retry (default: 1s)
    pub initial_delay: Duration,
    /// Cap applied before jitter (default: 10s)
    pub max_delay: Duration,
    /// Fraction of the delay used as jitter amplitude (default: 0.1)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RetryPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_retries: config.retry_max_attempts,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self { max_retries: 0, ..Default::default() }
    }
}

/// Backoff delay for the zero-based retry `attempt`, with random jitter.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let unit = rand::thread_rng().gen_range(-1.0..=1.0);
    backoff_delay_with(attempt, policy, unit)
}

/// Backoff delay with an explicit jitter sample `unit` in `[-1, 1]`.
pub fn backoff_delay_with(attempt: u32, policy: &RetryPolicy, unit: f64) -> Duration {
    let initial = policy.initial_delay.as_millis() as f64;
    let cap = policy.max_delay.as_millis() as f64;
    let delay = (initial * 2f64.powi(attempt.min(62) as i32)).min(cap);
    let jitter = delay * policy.jitter_factor * unit.clamp(-1.0, 1.0);
    let total = (delay + jitter).floor().max(0.0);
    Duration::from_millis(total as u64)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the retry
/// budget is spent.
///
/// `on_retry` is told `(attempt_number, error, delay)` before each sleep, with
/// `attempt_number` starting at 1. It is for telemetry only.
pub async fn retry<T, F, Fut, O>(policy: &RetryPolicy, mut op: F, mut on_retry: O) -> Result<T, ClassifiedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClassifiedError>>,
    O: FnMut(u32, &ClassifiedError, Duration),
{
    let mut attempt = 0u32;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.retryable() || attempt >= policy.max_retries {
            if attempt > 0 {
                tracing::debug!(attempts = attempt + 1, kind = %err.kind(), "giving up after retries");
            }
            return Err(err);
        }

        let delay = backoff_delay(attempt, policy);
        attempt += 1;

        tracing::warn!(
            attempt,
            kind = %err.kind(),
            delay_ms = delay.as_millis() as u64,
            url = err.url().unwrap_or(""),
            "retrying after failure"
        );
        on_retry(attempt, &err, delay);

        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripfetch_core::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter_factor: 0.1,
        }
    }

    fn retryable() -> ClassifiedError {
        ClassifiedError::new(ErrorKind::ConnectionError, "reset")
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(1_000));
        assert_eq!(policy.max_delay, Duration::from_millis(10_000));
        assert_eq!(policy.jitter_factor, 0.1);
    }

    #[test]
    fn test_backoff_without_jitter() {
        let p = policy(5);
        assert_eq!(backoff_delay_with(0, &p, 0.0), Duration::from_millis(100));
        assert_eq!(backoff_delay_with(1, &p, 0.0), Duration::from_millis(200));
        assert_eq!(backoff_delay_with(2, &p, 0.0), Duration::from_millis(400));
        assert_eq!(backoff_delay_with(3, &p, 0.0), Duration::from_millis(800));
        assert_eq!(backoff_delay_with(4, &p, 0.0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay_with(40, &p, 0.0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_extremes() {
        let p = policy(5);
        assert_eq!(backoff_delay_with(1, &p, 1.0), Duration::from_millis(220));
        assert_eq!(backoff_delay_with(1, &p, -1.0), Duration::from_millis(180));
        assert_eq!(backoff_delay_with(10, &p, 1.0), Duration::from_millis(1_100));
    }

    #[test]
    fn test_backoff_never_negative() {
        let p = RetryPolicy { jitter_factor: 2.0, ..policy(3) };
        assert_eq!(backoff_delay_with(0, &p, -1.0), Duration::ZERO);
    }

    #[test]
    fn test_backoff_random_within_bounds() {
        let p = policy(5);
        for attempt in 0..4u32 {
            let base = 100.0 * 2f64.powi(attempt as i32);
            let low = (base * 0.9).floor() as u64;
            let high = (base.min(1_000.0) * 1.1) as u64;
            for _ in 0..200 {
                let delay = backoff_delay(attempt, &p).as_millis() as u64;
                assert!(delay >= low && delay <= high, "attempt {attempt}: {delay} not in [{low}, {high}]");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = &AtomicU32::new(0);
        let result = retry(
            &policy(3),
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(retryable()) } else { Ok(n) }
            },
            |_, _, _| {},
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_budget() {
        let calls = &AtomicU32::new(0);
        let mut observed = Vec::new();
        let result: Result<(), _> = retry(
            &policy(2),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(retryable())
            },
            |attempt, err, delay| observed.push((attempt, err.kind(), delay)),
        )
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::ConnectionError);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(observed.len(), 2);
        assert_eq!(observed[0].0, 1);
        assert_eq!(observed[1].0, 2);
        assert!(observed[0].2 >= Duration::from_millis(90) && observed[0].2 <= Duration::from_millis(110));
        assert!(observed[1].2 >= Duration::from_millis(180) && observed[1].2 <= Duration::from_millis(220));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_returns_immediately() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = retry(
            &policy(5),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClassifiedError::http("https://example.com", 404, "Not Found"))
            },
            |_, _, _| panic!("non-retryable errors must not be retried"),
        )
        .await;

        assert_eq!(result.unwrap_err().status(), Some(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_attempts_bounded() {
        // attempts = min(failures_until_success, max_retries + 1)
        for (failures, max_retries, expected) in [(1u32, 3u32, 2u32), (10, 3, 4), (0, 3, 1), (2, 0, 1)] {
            let calls = &AtomicU32::new(0);
            let _ = retry(
                &policy(max_retries),
                move || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < failures { Err(retryable()) } else { Ok(()) }
                },
                |_, _, _| {},
            )
            .await;
            assert_eq!(calls.load(Ordering::SeqCst), expected, "failures={failures} max_retries={max_retries}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_sleeps_between_attempts() {
        let start = tokio::time::Instant::now();
        let calls = &AtomicU32::new(0);
        let p = RetryPolicy { jitter_factor: 0.0, ..policy(2) };
        let _: Result<(), _> = retry(
            &p,
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(retryable())
            },
            |_, _, _| {},
        )
        .await;

        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }
}
