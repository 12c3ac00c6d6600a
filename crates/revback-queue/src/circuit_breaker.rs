use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_attempts: 3,
        }
    }
}

/// A three-state gate for one downstream target. State lives in-process;
/// each worker process tracks its own view of a target's health, which is
/// sufficient per §5 — there's no cross-process coordination requirement for
/// circuit state.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    half_open_attempts: AtomicU32,
    opened_at: RwLock<Option<DateTime<Utc>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            half_open_attempts: AtomicU32::new(0),
            opened_at: RwLock::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.check_timeout();
        *self.state.read().unwrap()
    }

    /// Whether a call should be allowed through right now. In `HalfOpen`,
    /// only `half_open_max_attempts` probes are allowed before further calls
    /// are rejected until the next transition.
    pub fn allow_request(&self) -> bool {
        self.check_timeout();
        match *self.state.read().unwrap() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let current = self.half_open_attempts.fetch_add(1, Ordering::SeqCst);
                current < self.config.half_open_max_attempts
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.write().unwrap();
        match *state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.half_open_max_attempts {
                    *state = CircuitState::Closed;
                    self.reset_counters();
                    tracing::info!("circuit breaker closed after half-open success streak");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.write().unwrap();
        match *state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                self.open(&mut state);
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, state: &mut CircuitState) {
        *state = CircuitState::Open;
        *self.opened_at.write().unwrap() = Some(Utc::now());
        self.reset_counters();
        tracing::warn!("circuit breaker opened");
    }

    fn reset_counters(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        self.half_open_attempts.store(0, Ordering::SeqCst);
    }

    fn check_timeout(&self) {
        let should_transition = {
            let state = self.state.read().unwrap();
            if *state != CircuitState::Open {
                return;
            }
            let opened_at = self.opened_at.read().unwrap();
            match *opened_at {
                Some(opened) => {
                    Utc::now() - opened >= chrono::Duration::from_std(self.config.reset_timeout).unwrap()
                }
                None => false,
            }
        };

        if should_transition {
            let mut state = self.state.write().unwrap();
            if *state == CircuitState::Open {
                *state = CircuitState::HalfOpen;
                self.reset_counters();
                tracing::info!("circuit breaker half-open, probing");
            }
        }
    }
}

/// Process-wide registry of breakers keyed by target name, created lazily on
/// first use so new outbound targets need no upfront registration.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, target: &str) -> std::sync::Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().unwrap().get(target) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(target.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            half_open_max_attempts: 2,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn transitions_to_half_open_after_timeout() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        sleep(Duration::from_millis(80));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn closes_after_half_open_success_streak() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        sleep(Duration::from_millis(80));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        sleep(Duration::from_millis(80));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn closed_state_allows_requests() {
        let cb = CircuitBreaker::new(fast_config());
        assert!(cb.allow_request());
    }
}
