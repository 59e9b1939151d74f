//! Retry with exponential backoff
//!
//! Two flavours share one backoff schedule:
//! - `retry_transient`: bounded attempt count, caller classifies which errors retry
//!   (AI provider requests).
//! - `retry_on_lock`: bounded wall-clock time, retries only SQLite lock contention
//!   (database writes).

use cgx_common::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self { initial_ms, max_ms }
    }

    /// Delay before retry number `retry` (1-based): initial × 2^(retry-1), capped
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_ms.saturating_mul(factor).min(self.max_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(500, 30_000)
    }
}

/// Retry an operation up to `max_retries` extra times while `is_transient` holds
///
/// Permanent errors return immediately. The final transient error is returned
/// once retries are exhausted.
pub async fn retry_transient<F, Fut, T, E>(
    operation_name: &str,
    max_retries: u32,
    backoff: Backoff,
    is_transient: impl Fn(&E) -> bool,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retry = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    tracing::debug!(operation = operation_name, retry, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if is_transient(&err) && retry < max_retries => {
                retry += 1;
                let delay = backoff.delay(retry);
                tracing::warn!(
                    operation = operation_name,
                    retry,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, will retry after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if retry > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        retries = retry,
                        error = %err,
                        "Giving up"
                    );
                }
                return Err(err);
            }
        }
    }
}

/// Retry a database operation on lock contention until `max_wait_ms` elapses
///
/// Backoff starts at 10ms and doubles up to 1000ms. Non-lock errors return
/// immediately.
pub async fn retry_on_lock<F, Fut, T>(operation_name: &str, max_wait_ms: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let backoff = Backoff::new(10, 1000);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Database operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if err.is_lock_contention() => {
                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        max_wait_ms,
                        "Database operation failed: max retry time exceeded"
                    );
                    return Err(Error::Internal(format!(
                        "Database locked after {} attempts ({} ms elapsed, max {} ms)",
                        attempt,
                        elapsed.as_millis(),
                        max_wait_ms
                    )));
                }

                let delay = backoff.delay(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    "Database locked, will retry after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::new(100, 1000);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1000));
        assert_eq!(backoff.delay(200), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let attempts = AtomicU32::new(0);

        let result: std::result::Result<u32, String> = retry_transient(
            "flaky",
            3,
            Backoff::new(1, 1),
            |_e: &String| true,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err("timeout".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let attempts = AtomicU32::new(0);

        let result: std::result::Result<(), String> = retry_transient(
            "always_failing",
            2,
            Backoff::new(1, 1),
            |_e: &String| true,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("rate limited".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        // One attempt plus two retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let attempts = AtomicU32::new(0);

        let result: std::result::Result<(), String> = retry_transient(
            "bad_request",
            5,
            Backoff::new(1, 1),
            |e: &String| e != "400",
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("400".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_lock_error_fails_immediately() {
        let mut attempts = 0;

        let result = retry_on_lock("test_op", 5000, || {
            attempts += 1;
            async move { Err::<i32, Error>(Error::Internal("other error".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
