//! Per-provider circuit breaker.
//!
//! Closed → Open when failures reach the threshold; Open → HalfOpen after
//! the recovery timeout admits a bounded number of probe calls; any
//! HalfOpen failure reopens, enough successes close. State and the
//! counters that drive it live under one mutex so transitions are atomic.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{DncError, DncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 5,
        }
    }
}

impl CircuitBreakerConfig {
    /// State registries are smaller and flakier: trip earlier, recover
    /// slower.
    pub fn for_state_provider() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure_time: Option<Instant>,
    open_transitions: u64,
}

/// Snapshot of the breaker for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub open_transitions: u64,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure_time: None,
                open_transitions: 0,
            }),
        }
    }

    /// Admit or refuse one call. In Open the refusal costs no network;
    /// after the recovery timeout the next call transitions to HalfOpen
    /// and is admitted as a probe.
    pub fn try_acquire(&self, provider: &str) -> DncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure_time
                    .is_some_and(|at| at.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    debug!(provider, "circuit half-open: admitting probe call");
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.half_open_calls = 1;
                    Ok(())
                } else {
                    Err(DncError::ProviderUnavailable(format!(
                        "circuit open for provider {provider}"
                    )))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(DncError::ProviderUnavailable(format!(
                        "circuit half-open call budget exhausted for provider {provider}"
                    )))
                }
            }
        }
    }

    /// Record a successful call. Returns true when this success closed the
    /// circuit.
    pub fn record_success(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                false
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_calls = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Record a failed call. Returns true when this failure opened the
    /// circuit.
    pub fn record_failure(&self, provider: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(provider, failures = inner.failure_count, "circuit opened");
                    inner.state = CircuitState::Open;
                    inner.open_transitions += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                warn!(provider, "circuit reopened from half-open");
                inner.state = CircuitState::Open;
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_calls = 0;
                inner.open_transitions += 1;
                true
            }
            CircuitState::Open => false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().unwrap();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            open_transitions: inner.open_transitions,
        }
    }

    /// Force the breaker open (operational kill switch).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Open;
        inner.last_failure_time = Some(Instant::now());
        inner.open_transitions += 1;
    }

    /// Force the breaker closed and clear its counters.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_calls = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_millis(20),
            half_open_max_calls: 2,
        }
    }

    #[test]
    fn test_opens_at_failure_threshold() {
        let breaker = CircuitBreaker::new(fast_config());
        assert!(!breaker.record_failure("p"));
        assert!(!breaker.record_failure("p"));
        assert!(breaker.record_failure("p"));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire("p").is_err());
    }

    #[test]
    fn test_half_open_after_recovery_and_closes_on_successes() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure("p");
        }
        assert!(breaker.try_acquire("p").is_err());

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.try_acquire("p").is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(!breaker.record_success());
        assert!(breaker.record_success());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure("p");
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.try_acquire("p").is_ok());
        assert!(breaker.record_failure("p"));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_call_budget() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure("p");
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.try_acquire("p").is_ok());
        assert!(breaker.try_acquire("p").is_ok());
        // budget of 2 exhausted
        assert!(breaker.try_acquire("p").is_err());
    }

    #[test]
    fn test_success_in_closed_resets_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure("p");
        breaker.record_failure("p");
        breaker.record_success();
        // counter reset: two more failures do not open
        breaker.record_failure("p");
        breaker.record_failure("p");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_force_setters() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.force_open();
        assert!(breaker.try_acquire("p").is_err());
        breaker.force_close();
        assert!(breaker.try_acquire("p").is_ok());
    }
}
