//! Backoff and deadlines for collaborator requests
//!
//! Token fetches go through [`retry_with_backoff`] inside [`with_timeout`];
//! the boot as a whole is bounded by [`with_timeout`] as well.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use callbridge_session_core::config::duration_ms;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error::{ClientError, ClientResult};

/// Configuration for retry behavior
///
/// ```rust
/// # use callbridge_client_core::client::recovery::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::default();
/// assert_eq!(config.max_attempts, 3);
/// assert_eq!(config.initial_delay, Duration::from_millis(100));
/// assert!(config.use_jitter);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add ±10% jitter to delays
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fast retries for short network requests
    pub fn quick() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            use_jitter: true,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay before retry number `retry` (1-based), before jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

/// Retry an async operation with exponential backoff
///
/// Only errors for which [`ClientError::is_recoverable`] holds are retried;
/// anything else is returned immediately. Rate-limit errors are handed back
/// to the caller, which owns the retry-after decision.
pub async fn retry_with_backoff<T, F, Fut>(
    operation_name: &str,
    config: RetryConfig,
    mut operation: F,
) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "recovered after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        // Rate limits carry their own retry-after; the caller decides
        let retryable = err.is_recoverable() && !matches!(err, ClientError::RateLimited { .. });
        if !retryable || attempt >= config.max_attempts {
            error!(
                operation = operation_name,
                attempt,
                retryable,
                category = err.category(),
                error = %err,
                "giving up"
            );
            return Err(err);
        }

        let delay = jittered(config.delay_for(attempt), config.use_jitter);
        warn!(
            operation = operation_name,
            attempt,
            of = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, backing off"
        );
        sleep(delay).await;
    }
}

/// Spread `delay` by up to 10% either way
fn jittered(delay: Duration, enabled: bool) -> Duration {
    if !enabled {
        return delay;
    }
    let spread = rand::thread_rng().gen_range(-0.1..=0.1);
    delay.mul_f64(1.0 + spread)
}

/// Bound a future by `timeout`, mapping expiry to `OperationTimeout`
pub async fn with_timeout<T, F>(operation_name: &str, timeout: Duration, future: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            let duration_ms = timeout.as_millis() as u64;
            error!(operation = operation_name, duration_ms, "deadline exceeded");
            Err(ClientError::OperationTimeout { operation: operation_name.to_string(), duration_ms })
        }
    }
}

/// Attach context to foreign errors as `InternalError`
pub trait ErrorContext<T> {
    fn context(self, context: &str) -> ClientResult<T>;
}

impl<T, E: Display> ErrorContext<T> for Result<T, E> {
    fn context(self, context: &str) -> ClientResult<T> {
        self.map_err(|e| ClientError::InternalError { message: format!("{context}: {e}") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_success() {
        let attempts = AtomicU32::new(0);

        let result = retry_with_backoff("test_operation", RetryConfig::quick(), || async {
            let current = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if current < 3 {
                Err(ClientError::network_error("temporary failure"))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_non_recoverable() {
        let attempts = AtomicU32::new(0);

        let result: ClientResult<i32> = retry_with_backoff("test_operation", RetryConfig::default(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::Forbidden { reason: "no calling".to_string() })
        })
        .await;

        assert!(matches!(result, Err(ClientError::Forbidden { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);

        let result: ClientResult<()> =
            retry_with_backoff("test_operation", RetryConfig::default().without_jitter(), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::ServerError { status: 503 })
            })
            .await;

        assert!(matches!(result, Err(ClientError::ServerError { status: 503 })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_progression_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            use_jitter: false,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
        assert_eq!(config.delay_for(4), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_to_operation_timeout() {
        let result: ClientResult<()> = with_timeout("token fetch", Duration::from_secs(30), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        match result {
            Err(ClientError::OperationTimeout { operation, duration_ms }) => {
                assert_eq!(operation, "token fetch");
                assert_eq!(duration_ms, 30000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_context() {
        let parsed: Result<u8, _> = "x".parse::<u8>();
        let err = parsed.context("parsing port").unwrap_err();
        assert!(matches!(err, ClientError::InternalError { ref message } if message.starts_with("parsing port")));
    }
}
