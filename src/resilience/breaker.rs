//! Per-service circuit breaker.
//!
//! States:
//! - `Closed`: calls pass; consecutive failures count up, and crossing
//!   the threshold opens the circuit.
//! - `Open`: calls are rejected without touching the service until the
//!   reset timeout elapses, then the next call is let through half-open.
//! - `HalfOpen`: probe calls pass; the configured number of consecutive
//!   successes closes the circuit, any failure reopens it and restarts
//!   the reset clock.
//!
//! A success in `Closed` or `HalfOpen` resets the failure counter.
//! Transitions happen inside one lock scope; no await is held across it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
#[error("circuit open for service {service}")]
pub struct CircuitOpen {
    pub service: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub required_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            required_successes: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
}

pub struct CircuitBreaker {
    service: String,
    cfg: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, cfg: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            cfg,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                half_open_successes: 0,
                opened_at: None,
                last_failure_at: None,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Gate a call. Rejects while open; flips open to half-open once the
    /// reset timeout has elapsed, admitting the caller as the probe.
    pub fn acquire(&self) -> Result<(), CircuitOpen> {
        let mut g = self.inner.lock();

        match g.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = g.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.cfg.reset_timeout {
                    g.state = CircuitState::HalfOpen;
                    g.half_open_successes = 0;
                    info!(service = %self.service, "circuit half-open; probing");
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        service: self.service.clone(),
                    })
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut g = self.inner.lock();
        g.failures = 0;

        if g.state == CircuitState::HalfOpen {
            g.half_open_successes += 1;
            if g.half_open_successes >= self.cfg.required_successes {
                g.state = CircuitState::Closed;
                g.opened_at = None;
                g.half_open_successes = 0;
                info!(service = %self.service, "circuit closed after successful probes");
            }
        }
    }

    pub fn on_failure(&self) {
        let mut g = self.inner.lock();
        g.last_failure_at = Some(Instant::now());

        match g.state {
            CircuitState::Closed => {
                g.failures += 1;
                if g.failures >= self.cfg.failure_threshold {
                    g.state = CircuitState::Open;
                    g.opened_at = Some(Instant::now());
                    warn!(
                        service = %self.service,
                        failures = g.failures,
                        "failure threshold crossed; circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // A failed probe reopens and restarts the reset clock.
                g.state = CircuitState::Open;
                g.opened_at = Some(Instant::now());
                g.half_open_successes = 0;
                warn!(service = %self.service, "probe failed; circuit reopened");
            }
            CircuitState::Open => {}
        }
    }
}
