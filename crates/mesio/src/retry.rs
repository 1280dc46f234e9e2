// Retry utility: shared retry-with-backoff logic for HTTP requests, segment
// and key fetching.
//
// Implements exponential backoff with optional jitter and a max delay cap.

use crate::error::HttpError;
use rand::RngExt;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Base delay between retries. Actual delay = base * 2^attempt + jitter.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, base_delay/2).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 2^attempt is computed with a checked shift so attempts >= 32 saturate.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Jitter is limited so the final delay never exceeds `max_delay`.
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Errors that can report a cancelled retry loop.
pub trait RetryError: Display {
    fn cancelled() -> Self;
}

impl RetryError for HttpError {
    fn cancelled() -> Self {
        HttpError::Cancelled
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T, E> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed with a retryable error (network, 5xx, timeout).
    Retry(E),
    /// Operation failed with a non-retryable error (4xx, parse error).
    Fail(E),
}

impl<T> RetryAction<T, HttpError> {
    /// Classify an HTTP result by [`HttpError::is_retryable`].
    pub fn from_http(result: Result<T, HttpError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_retryable() => Self::Retry(err),
            Err(err) => Self::Fail(err),
        }
    }
}

/// Execute an async operation with retry-and-backoff.
///
/// The `operation` closure receives the current attempt number (0-indexed) and
/// returns a [`RetryAction`]. After the last retry the last error surfaces.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, E>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T, E>>,
    E: RetryError,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(E::cancelled());
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(E::cancelled());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn server_error() -> HttpError {
        HttpError::Status {
            status: StatusCode::BAD_GATEWAY,
            url: "http://example.com".to_string(),
        }
    }

    #[test]
    fn delay_respects_max_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn delay_without_jitter_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn delay_with_jitter_stays_in_range() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..32 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn fails_immediately_on_non_retryable() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter: false,
        };
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, HttpError> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Fail(HttpError::invalid_url("x", "bad")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_then_surfaces_last_error() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(1),
            jitter: false,
        };
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, HttpError> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(server_error()) }
        })
        .await;
        assert_eq!(
            result.unwrap_err().status(),
            Some(StatusCode::BAD_GATEWAY)
        );
        // Initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_second_attempt() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(1),
            jitter: false,
        };
        let token = CancellationToken::new();
        let result = retry_with_backoff(&policy, &token, |attempt| async move {
            if attempt == 0 {
                RetryAction::Retry(server_error())
            } else {
                RetryAction::Success(99u32)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test]
    async fn respects_cancellation() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(100),
            max_delay: Duration::from_secs(100),
            jitter: false,
        };
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32, HttpError> =
            retry_with_backoff(&policy, &token, |_| async { RetryAction::Success(1u32) }).await;
        assert!(matches!(result, Err(HttpError::Cancelled)));
    }

    #[test]
    fn classifies_http_results() {
        assert!(matches!(
            RetryAction::from_http(Err::<(), _>(server_error())),
            RetryAction::Retry(_)
        ));
        assert!(matches!(
            RetryAction::from_http(Err::<(), _>(HttpError::Status {
                status: StatusCode::NOT_FOUND,
                url: String::new(),
            })),
            RetryAction::Fail(_)
        ));
    }
}
