//! Circuit breaker guarding the connection pool against a wedged backend.
//!
//! Three states, as in any textbook breaker: closed (normal), open (fail
//! fast), half-open (probing). State transitions are logged via `tracing`
//! so the breaker is itself observable.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Consecutive successes in half-open before the breaker closes.
    pub success_threshold: u32,
    /// How long the breaker stays open before admitting half-open probes.
    pub recovery_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_window: Duration::from_secs(60),
        }
    }
}

/// A single shared breaker, protected by an internal mutex for the
/// open→half-open wall-clock check and plain atomics for the hot counters.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            opened_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BreakerState {
        // Lazily flip open -> half-open once the recovery window elapses.
        if self.state.load(Ordering::Acquire) == OPEN {
            let mut opened_at = self.opened_at.lock();
            if let Some(at) = *opened_at {
                if at.elapsed() >= self.config.recovery_window {
                    self.state.store(HALF_OPEN, Ordering::Release);
                    self.consecutive_successes.store(0, Ordering::Release);
                    *opened_at = None;
                    tracing::warn!("circuit breaker: open -> half-open (recovery window elapsed)");
                }
            }
        }
        match self.state.load(Ordering::Acquire) {
            CLOSED => BreakerState::Closed,
            OPEN => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }

    /// Whether a call should be admitted right now.
    pub fn allow(&self) -> bool {
        self.state() != BreakerState::Open
    }

    pub fn record_success(&self) {
        match self.state() {
            BreakerState::HalfOpen => {
                let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.state.store(CLOSED, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Release);
                    self.consecutive_successes.store(0, Ordering::Release);
                    tracing::info!("circuit breaker: half-open -> closed");
                }
            }
            BreakerState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            BreakerState::HalfOpen => {
                self.open();
            }
            BreakerState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.open();
                }
            }
            BreakerState::Open => {}
        }
    }

    fn open(&self) {
        self.state.store(OPEN, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        *self.opened_at.lock() = Some(Instant::now());
        tracing::error!("circuit breaker: opened");
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.allow());
    }

    #[test]
    fn closes_after_success_threshold_in_half_open() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            recovery_window: Duration::from_millis(1),
        });
        breaker.record_failure();
        assert!(!breaker.allow());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn any_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 3,
            recovery_window: Duration::from_millis(1),
        });
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
