//! Retry with exponential backoff.
//!
//! Every backend call in the crate goes through [`retry`] with one of the
//! presets below. Counter increments and dirty-set claims are the exception:
//! they are not idempotent, so they run exactly once.
//!
//! # Example
//!
//! ```
//! use product_stats_engine::RetryConfig;
//!
//! // Startup: fail fast on a bad connection string
//! assert_eq!(RetryConfig::startup().max_retries, Some(5));
//!
//! // Single fast-tier or durable query
//! assert_eq!(RetryConfig::query().max_retries, Some(3));
//!
//! // Background jobs back off for longer between attempts
//! assert!(RetryConfig::job().initial_delay > RetryConfig::query().initial_delay);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff policy for a retried operation.
///
/// Presets:
/// - [`RetryConfig::startup()`] for initial connections
/// - [`RetryConfig::query()`] for single reads and idempotent writes
/// - [`RetryConfig::batch_write()`] for chunked durable upserts
/// - [`RetryConfig::job()`] for queued background jobs
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts. `None` retries forever.
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// 5 attempts, 200ms doubling to 2s. Surfaces configuration errors in a
    /// few seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// 3 attempts with fast backoff, then the caller handles the error.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Durable batch upserts are overwrites, so repeating one is safe.
    #[must_use]
    pub fn batch_write() -> Self {
        Self {
            max_retries: Some(4),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
        }
    }

    /// Queued jobs: 5 attempts starting at 1s.
    #[must_use]
    pub fn job() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        }
    }

    /// Minimal delays for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay before the attempt after `delay`.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or the attempts in `config` run out.
/// The last error is returned unchanged.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                match config.max_retries {
                    Some(max) if attempts >= max => {
                        crate::metrics::record_retry_exhausted(operation_name);
                        return Err(err);
                    }
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max_attempts = max,
                        error = %err,
                        next_delay = ?delay,
                        "Operation failed, retrying"
                    ),
                    None => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        next_delay = ?delay,
                        "Operation failed, will retry forever"
                    ),
                }

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::fast(), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::fast(), || {
            let a = attempts.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError(format!("fail {}", count)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error_when_exhausted() {
        let attempts = Arc::new(AtomicUsize::new(0));

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::fast(), || {
            let a = attempts.clone();
            async move {
                let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                Err(TestError(format!("attempt {}", n)))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().0, "attempt 3");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_presets() {
        assert_eq!(RetryConfig::startup().max_retries, Some(5));
        assert_eq!(RetryConfig::query().max_retries, Some(3));
        assert_eq!(RetryConfig::batch_write().max_retries, Some(4));
        assert_eq!(RetryConfig::job().max_retries, Some(5));

        let presets = [
            RetryConfig::startup(),
            RetryConfig::query(),
            RetryConfig::batch_write(),
            RetryConfig::job(),
            RetryConfig::fast(),
        ];
        assert!(presets.iter().all(|preset| preset.max_retries.is_some()));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            factor: 2.0,
            max_retries: Some(5),
        };

        let d1 = config.next_delay(config.initial_delay);
        let d2 = config.next_delay(d1);
        let d3 = config.next_delay(d2);
        assert_eq!(d1, Duration::from_millis(200));
        assert_eq!(d2, Duration::from_millis(350));
        assert_eq!(d3, Duration::from_millis(350));
    }
}
