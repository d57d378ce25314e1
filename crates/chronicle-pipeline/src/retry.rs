//! Bounded retries around one window's generation call.
//!
//! Only errors for which [`ChronicleError::is_retryable`] holds are retried.
//! When the budget runs out the window fails with
//! [`ChronicleError::RetriesExhausted`], which keeps the last agent error as
//! its source so the failed run records the root cause.

use std::future::Future;
use std::time::Duration;

use chronicle_types::{ChronicleError, Result, WindowKey};

use crate::config::RetryConfig;

/// Wait between failed generation attempts: `base` doubled per consecutive
/// failure, never longer than `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    /// Retry at once. Used when the configured base delay is zero.
    pub const IMMEDIATE: Backoff = Backoff {
        base: Duration::ZERO,
        cap: Duration::ZERO,
    };

    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Wait after the `failures`-th failed attempt (1-based).
    pub fn after(&self, failures: usize) -> Duration {
        let exponent = u32::try_from(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Call `generate` for `window` until it succeeds, fails terminally, or
/// `retry.max_retries` retries have been spent. `on_retry` sees the 1-based
/// number of the failed attempt before each wait.
pub async fn retry_generation<T, F, Fut>(
    window: &WindowKey,
    retry: &RetryConfig,
    generate: F,
    on_retry: impl Fn(usize, &ChronicleError),
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = retry.backoff();
    let attempts = retry.max_retries + 1;
    let mut failures = 0;
    loop {
        let err = match generate().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };
        failures += 1;
        if failures == attempts {
            tracing::warn!(window = %window, attempts, error = %err, "Generation retries exhausted");
            return Err(ChronicleError::RetriesExhausted {
                window: window.to_string(),
                attempts,
                last_error: Box::new(err),
            });
        }
        let wait = backoff.after(failures);
        tracing::warn!(
            window = %window,
            attempt = failures,
            delay_ms = %wait.as_millis(),
            error = %err,
            "Generation failed, retrying"
        );
        on_retry(failures, &err);
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn window() -> WindowKey {
        WindowKey {
            tenant_id: "acme".into(),
            source: "chat".into(),
            start: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
        }
    }

    fn immediate(max_retries: usize) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_ms: 0,
            max_ms: 0,
        }
    }

    fn rate_limited() -> ChronicleError {
        ChronicleError::Generation {
            message: "rate limited".into(),
            retryable: true,
        }
    }

    // 1. A first-try success never waits
    #[tokio::test]
    async fn first_attempt_succeeds() {
        let result = retry_generation(&window(), &immediate(3), || async { Ok("digest") }, |_, _| {
            panic!("no retry expected")
        })
        .await;
        assert_eq!(result.unwrap(), "digest");
    }

    // 2. A transient failure is retried and reported to the callback
    #[tokio::test]
    async fn transient_failure_is_retried() {
        let calls = AtomicUsize::new(0);
        let seen = AtomicUsize::new(0);
        let result = retry_generation(
            &window(),
            &immediate(3),
            || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(rate_limited()),
                    n => Ok(n),
                }
            },
            |failed, _| {
                seen.store(failed, Ordering::SeqCst);
            },
        )
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    // 3. Exhaustion keeps the last agent error as the cause
    #[tokio::test]
    async fn exhaustion_keeps_last_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_generation(
            &window(),
            &immediate(2),
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(ChronicleError::Generation {
                    message: format!("upstream 503 on call {n}"),
                    retryable: true,
                })
            },
            |_, _| {},
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("upstream 503 on call 2"), "{err}");
        match err {
            ChronicleError::RetriesExhausted {
                window: w,
                attempts,
                last_error,
            } => {
                assert_eq!(w, window().to_string());
                assert_eq!(attempts, 3);
                assert!(matches!(*last_error, ChronicleError::Generation { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    // 4. Terminal errors are returned without retrying
    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_generation(
            &window(),
            &immediate(5),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ChronicleError::Generation {
                    message: "prompt rejected".into(),
                    retryable: false,
                })
            },
            |_, _| {},
        )
        .await;
        assert!(matches!(
            result.unwrap_err(),
            ChronicleError::Generation { retryable: false, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // 5. Waits double from the base and stop at the cap
    #[test]
    fn backoff_doubles_up_to_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_millis(500));
        let waits: Vec<u128> = (1..=4).map(|n| backoff.after(n).as_millis()).collect();
        assert_eq!(waits, vec![100, 200, 400, 500]);
        assert_eq!(backoff.after(200), Duration::from_millis(500));
        assert_eq!(Backoff::IMMEDIATE.after(3), Duration::ZERO);
    }
}
