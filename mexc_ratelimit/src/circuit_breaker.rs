use std::fmt;

use crate::config::BreakerSettings;
use crate::store::KeyedStore;

/// State of a per-key circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Requests are rejected outright
    Open,
    /// One probe is allowed through to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker bookkeeping for one key
#[derive(Debug, Clone)]
pub struct BreakerState {
    pub state: CircuitState,

    /// Consecutive failures observed while closed
    pub failure_count: u32,

    /// Millisecond timestamp of the last recorded failure
    pub last_failure_at: u64,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self { state: CircuitState::Closed, failure_count: 0, last_failure_at: 0 }
    }
}

/// Registry key convention shared with the platform's breaker dashboard
pub fn breaker_key(key: &str) -> String {
    format!("rate-limit-{key}")
}

/// Per-key circuit breakers
///
/// Transitions: closed -> open on the consecutive-failure threshold,
/// open -> half-open once the open timeout elapses (evaluated at gate time),
/// half-open -> closed on the next success, half-open -> open on the next
/// failure.
pub(crate) struct CircuitBreakerRegistry {
    store: KeyedStore<BreakerState>,
    settings: BreakerSettings,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self { store: KeyedStore::new(), settings }
    }

    /// Gate consulted before either admission algorithm runs. Handles the
    /// open -> half-open transition and returns the state the caller must
    /// honor: `Open` is a hard veto independent of remaining quota.
    pub fn check_gate(&self, key: &str, now: u64) -> CircuitState {
        self.store.update(&breaker_key(key), BreakerState::default, |breaker| {
            if breaker.state == CircuitState::Open && now.saturating_sub(breaker.last_failure_at) > self.settings.open_timeout_ms {
                breaker.state = CircuitState::HalfOpen;
                tracing::warn!(key, "circuit half-open, admitting probe");
            }
            breaker.state
        })
    }

    pub fn record_success(&self, key: &str) {
        self.store.update(&breaker_key(key), BreakerState::default, |breaker| {
            match breaker.state {
                CircuitState::HalfOpen => {
                    breaker.state = CircuitState::Closed;
                    breaker.failure_count = 0;
                    tracing::warn!(key, "circuit closed after successful probe");
                }
                CircuitState::Closed => {
                    // The threshold counts consecutive failures
                    breaker.failure_count = 0;
                }
                CircuitState::Open => {}
            }
        });
    }

    pub fn record_failure(&self, key: &str, now: u64) {
        let threshold = self.settings.failure_threshold;
        self.store.update(&breaker_key(key), BreakerState::default, |breaker| {
            breaker.failure_count += 1;
            breaker.last_failure_at = now;

            match breaker.state {
                CircuitState::HalfOpen => {
                    breaker.state = CircuitState::Open;
                    tracing::warn!(key, "circuit reopened, probe failed");
                }
                CircuitState::Closed if breaker.failure_count >= threshold => {
                    breaker.state = CircuitState::Open;
                    tracing::warn!(key, failures = breaker.failure_count, "circuit opened");
                }
                _ => {}
            }
        });
    }

    /// Read-only view, no transitions
    pub fn state(&self, key: &str) -> CircuitState {
        self.store.read(&breaker_key(key), |breaker| breaker.state).unwrap_or(CircuitState::Closed)
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.settings.open_retry_after_secs
    }

    pub fn open_timeout_ms(&self) -> u64 {
        self.settings.open_timeout_ms
    }

    pub fn remove(&self, key: &str) {
        self.store.remove(&breaker_key(key));
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}
