//! Circuit breaker around backend calls, built on `recloser`.
//!
//! The flush path writes to the durable tier through
//! [`TierCircuits::durable`]. While that circuit is open, flush cycles fail
//! fast and re-dirty their batch instead of piling retries onto a database
//! that is already down.

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error from a circuit-protected call.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the operation was not attempted
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failures in the closed-state window that trip the circuit
    pub failure_threshold: u32,
    /// Calls allowed through while half-open
    pub success_threshold: u32,
    /// Time spent open before probing again
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips fast, recovers cautiously. Used for the durable tier.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Short recovery window for tests.
    #[must_use]
    pub fn fast_recovery() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the breaker. `f` is not called while the circuit is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit open, call rejected");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// Breakers per storage tier. The fast tier has none; its errors fall
/// through on reads and re-dirty the batch on flush.
pub struct TierCircuits {
    pub durable: CircuitBreaker,
}

impl Default for TierCircuits {
    fn default() -> Self {
        Self {
            durable: CircuitBreaker::new("durable_tier", CircuitConfig::aggressive()),
        }
    }
}

impl TierCircuits {
    /// Custom breaker config (tests use short recovery windows).
    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            durable: CircuitBreaker::new("durable_tier", config),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> TierCircuitMetrics {
        TierCircuitMetrics {
            durable_calls: self.durable.calls_total(),
            durable_failures: self.durable.failures(),
            durable_rejections: self.durable.rejections(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierCircuitMetrics {
    pub durable_calls: u64,
    pub durable_failures: u64,
    pub durable_rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_call_passes_through() {
        let cb = CircuitBreaker::new("test", CircuitConfig::fast_recovery());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
    }

    #[tokio::test]
    async fn test_inner_error_is_preserved() {
        let cb = CircuitBreaker::new("test", CircuitConfig::fast_recovery());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_trip_or_count() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitConfig {
                failure_threshold: 2,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        );

        for _ in 0..4 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;

        // Exact tripping point is up to recloser's error-rate window
        assert_eq!(cb.calls_total(), 5);
        assert!(cb.failures() >= 2);
        assert_eq!(cb.failures() + cb.rejections() + cb.successes(), 5);
    }

    #[tokio::test]
    async fn test_tier_snapshot() {
        let circuits = TierCircuits::default();
        assert_eq!(circuits.durable.name(), "durable_tier");

        let _: Result<(), CircuitError<&str>> = circuits.durable.call(|| async { Ok(()) }).await;
        let _: Result<(), CircuitError<&str>> = circuits.durable.call(|| async { Err("down") }).await;

        let snap = circuits.snapshot();
        assert_eq!(snap.durable_calls, 2);
        assert_eq!(snap.durable_failures, 1);
    }
}
