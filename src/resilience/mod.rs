//! Resilience layer wrapped around every external call.
//!
//! Two composable primitives: retry-with-backoff and a per-service
//! circuit breaker. They compose as retry *inside* breaker — each
//! attempt is a protected call, so an open circuit short-circuits the
//! whole retry budget immediately instead of burning it against a dead
//! dependency.

pub mod breaker;
pub mod retry;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{error, warn};

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitOpen, CircuitState};
pub use retry::RetryPolicy;

/// Implemented by error types the wrapper can classify. Only transient
/// failures are retried.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Store operations are idempotent and safe to retry, so their failures
/// are treated as transient wholesale.
impl Transient for anyhow::Error {
    fn is_transient(&self) -> bool {
        true
    }
}

#[derive(Error, Debug)]
pub enum ResilienceError<E> {
    /// Failed fast without invoking the operation. Distinguished from
    /// `Exhausted` so callers can fall back to cached state instead of
    /// waiting out a retry budget.
    #[error("circuit open for service {service}")]
    CircuitOpen { service: String },

    /// The operation's own error, after the retry budget is spent or
    /// the failure is not retryable.
    #[error("{0}")]
    Exhausted(E),
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }
}

/// Shared retry policy plus one lazily-created breaker per service name.
pub struct Resilience {
    retry: RetryPolicy,
    breaker_cfg: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Resilience {
    pub fn new(retry: RetryPolicy, breaker_cfg: BreakerConfig) -> Self {
        Self {
            retry,
            breaker_cfg,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker guarding `service`, created on first use.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(service) {
            return Arc::clone(b);
        }

        let mut g = self.breakers.write();
        Arc::clone(
            g.entry(service.to_string())
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(service, self.breaker_cfg.clone()))
                }),
        )
    }

    /// Run `f` under the breaker for `service`, retrying transient
    /// failures with backoff. `operation` is a diagnostic label only.
    pub async fn call<T, E, F, Fut>(
        &self,
        service: &str,
        operation: &str,
        f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        E: std::fmt::Display + Transient,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker(service);

        for attempt in 1..=self.retry.max_attempts {
            if let Err(open) = breaker.acquire() {
                return Err(ResilienceError::CircuitOpen {
                    service: open.service,
                });
            }

            match f().await {
                Ok(v) => {
                    breaker.on_success();
                    return Ok(v);
                }
                Err(e) => {
                    breaker.on_failure();

                    if !e.is_transient() {
                        error!(
                            service,
                            operation,
                            attempt,
                            error = %e,
                            "permanent failure; not retrying"
                        );
                        return Err(ResilienceError::Exhausted(e));
                    }

                    if attempt == self.retry.max_attempts {
                        error!(
                            service,
                            operation,
                            attempt,
                            error = %e,
                            "retry budget exhausted"
                        );
                        return Err(ResilienceError::Exhausted(e));
                    }

                    let delay = self.retry.jittered_delay_for(attempt);
                    warn!(
                        service,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        unreachable!("retry loop returns on the final attempt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Error, Debug)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("fatal")]
        Fatal,
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    fn fast_resilience(max_attempts: u32, threshold: u32) -> Resilience {
        let mut retry =
            RetryPolicy::new(max_attempts, Duration::from_millis(1), 2.0, Duration::from_millis(4));
        retry.jitter = false;
        Resilience::new(
            retry,
            BreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(60),
                required_successes: 1,
            },
        )
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let r = fast_resilience(3, 100);
        let calls = AtomicU32::new(0);

        let out: Result<u32, _> = r
            .call("svc", "op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError::Flaky)
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_when_budget_exhausted() {
        let r = fast_resilience(3, 100);
        let calls = AtomicU32::new(0);

        let out: Result<u32, _> = r
            .call("svc", "op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Flaky) }
            })
            .await;

        assert!(matches!(out, Err(ResilienceError::Exhausted(TestError::Flaky))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let r = fast_resilience(5, 100);
        let calls = AtomicU32::new(0);

        let out: Result<u32, _> = r
            .call("svc", "op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            })
            .await;

        assert!(matches!(out, Err(ResilienceError::Exhausted(TestError::Fatal))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_every_attempt() {
        let r = fast_resilience(3, 2);

        // The first call's second failed attempt crosses the threshold,
        // so its own third attempt is already rejected.
        let _ = r
            .call::<u32, _, _, _>("svc", "op", || async { Err(TestError::Flaky) })
            .await;
        assert_eq!(r.breaker("svc").state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let out: Result<u32, _> = r
            .call("svc", "op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u32, TestError>(1) }
            })
            .await;

        assert!(matches!(out, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "operation must not run");
    }

    #[tokio::test]
    async fn breakers_are_isolated_per_service() {
        let r = fast_resilience(1, 1);

        let _ = r
            .call::<u32, _, _, _>("down", "op", || async { Err(TestError::Flaky) })
            .await;
        assert_eq!(r.breaker("down").state(), CircuitState::Open);

        let out: Result<u32, _> = r.call("up", "op", || async { Ok::<u32, TestError>(2) }).await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(r.breaker("up").state(), CircuitState::Closed);
    }
}
