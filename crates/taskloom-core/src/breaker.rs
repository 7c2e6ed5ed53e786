//! Circuit breaker protecting a single handler from repeated failures.
//!
//! States: Closed (normal), Open (fast-fail), HalfOpen (probing recovery).
//! The breaker opens once consecutive failures reach the threshold, probes
//! after the cooldown elapses, and closes again after enough consecutive
//! probe successes.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cooldown before an open circuit allows a probe.
    pub timeout: Duration,
    /// Consecutive successes in half-open required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                consecutive_successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may proceed. An open circuit whose cooldown has
    /// elapsed transitions to half-open and allows the probe.
    pub fn should_allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    tracing::info!(breaker = %self.name, "circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.consecutive_successes += 1;

        if inner.state == CircuitState::HalfOpen
            && inner.consecutive_successes >= self.config.success_threshold
        {
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            tracing::info!(breaker = %self.name, "circuit closed");
        } else if inner.state == CircuitState::Closed {
            inner.failure_count = inner.failure_count.saturating_sub(1);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.failure_count += 1;
        inner.consecutive_successes = 0;
        inner.last_failure = Some(Instant::now());

        if inner.failure_count >= self.config.failure_threshold {
            if inner.state != CircuitState::Open {
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "circuit opened"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock").state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().expect("breaker lock").failure_count
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.consecutive_successes = 0;
        inner.last_failure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout,
                success_threshold: 2,
            },
        )
    }

    #[test]
    fn starts_closed() {
        let cb = breaker(3, Duration::from_secs(5));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_allow());
    }

    #[test]
    fn opens_at_exactly_the_threshold() {
        let cb = breaker(5, Duration::from_secs(30));
        for i in 1..5 {
            cb.record_failure();
            assert!(cb.should_allow(), "still closed after {i} failures");
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow());
    }

    #[test]
    fn half_open_probe_then_close() {
        let cb = breaker(2, Duration::ZERO);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Zero cooldown: the next probe is allowed immediately.
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn failure_during_probe_reopens() {
        let cb = breaker(2, Duration::ZERO);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.should_allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn closed_success_decays_failures() {
        let cb = breaker(10, Duration::from_secs(30));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);
        cb.record_success();
        assert_eq!(cb.failure_count(), 1);
    }
}
