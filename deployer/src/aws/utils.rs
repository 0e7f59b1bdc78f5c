//! SDK configuration and the bounded polling helpers shared by every wait loop

use crate::aws::Error;
use aws_config::{retry::RetryConfig, BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::config::retry::ReconnectMode;
use std::future::Future;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

/// Attempts per SDK call, including the first
const MAX_SDK_ATTEMPTS: u32 = 3;

/// Loads the AWS configuration for `region` from the default credential chain
pub async fn sdk_config(region: Region) -> SdkConfig {
    let retry = RetryConfig::standard()
        .with_max_attempts(MAX_SDK_ATTEMPTS)
        .with_initial_backoff(Duration::from_millis(500))
        .with_max_backoff(Duration::from_secs(30))
        .with_reconnect_mode(ReconnectMode::ReconnectOnTransientError);
    aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .retry_config(retry)
        .load()
        .await
}

/// Polls `check` every `interval` until it returns `true`, failing once `timeout`
/// has elapsed since the first check.
///
/// The last sleep is shortened so the final check runs when `timeout` expires.
/// `check` receives the time elapsed so far. Returns the total time waited.
pub async fn poll_until<F, Fut>(
    operation: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<Duration, Error>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = Instant::now();
    loop {
        if check(start.elapsed()).await? {
            return Ok(start.elapsed());
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::Timeout {
                operation: operation.to_string(),
                elapsed,
            });
        }
        debug!(
            operation,
            elapsed_secs = elapsed.as_secs(),
            "condition not met, waiting"
        );
        sleep(interval.min(timeout - elapsed)).await;
    }
}

/// Calls `check` up to `max_attempts` times, sleeping `interval` between attempts,
/// until it returns `true`.
///
/// `check` receives the 1-based attempt number. Returns the attempt that succeeded.
pub async fn poll_attempts<F, Fut>(
    operation: &str,
    interval: Duration,
    max_attempts: usize,
    mut check: F,
) -> Result<usize, Error>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = Instant::now();
    for attempt in 1..=max_attempts {
        if check(attempt).await? {
            return Ok(attempt);
        }
        if attempt < max_attempts {
            debug!(operation, attempt, max_attempts, "condition not met, waiting");
            sleep(interval).await;
        }
    }
    Err(Error::Timeout {
        operation: operation.to_string(),
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_succeeds() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let waited = poll_until(
            "ready",
            Duration::from_secs(10),
            Duration::from_secs(600),
            move |_| async move { Ok(calls.fetch_add(1, Ordering::SeqCst) == 3) },
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(waited, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let result = poll_until(
            "never",
            Duration::from_secs(10),
            Duration::from_secs(60),
            |_| async { Ok(false) },
        )
        .await;
        match result {
            Err(Error::Timeout { operation, elapsed }) => {
                assert_eq!(operation, "never");
                assert_eq!(elapsed, Duration::from_secs(60));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_final_check_at_deadline() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = poll_until(
            "never",
            Duration::from_secs(10),
            Duration::from_secs(25),
            move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            },
        )
        .await;
        match result {
            Err(Error::Timeout { elapsed, .. }) => assert_eq!(elapsed, Duration::from_secs(25)),
            other => panic!("unexpected result: {other:?}"),
        }
        // Checks at 0s, 10s, 20s and 25s
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_propagates_errors() {
        let result = poll_until(
            "failing",
            Duration::from_secs(10),
            Duration::from_secs(60),
            |_| async { Err(Error::AccessDenied("bucket".into())) },
        )
        .await;
        assert!(matches!(result, Err(Error::AccessDenied(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_attempts_bounded() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let start = Instant::now();
        let result = poll_attempts("gone", Duration::from_secs(15), 20, move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 20);
        assert_eq!(start.elapsed(), Duration::from_secs(15 * 19));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_attempts_first_try() {
        let attempt = poll_attempts("gone", Duration::from_secs(15), 20, |_| async { Ok(true) })
            .await
            .unwrap();
        assert_eq!(attempt, 1);
    }
}
