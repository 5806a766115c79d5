//! Circuit Breaker Implementation
//!
//! This module provides a circuit breaker pattern implementation to isolate
//! failing service instances. Every registered instance gets its own breaker;
//! one slow or failing instance never affects the breaker of any other.
//!
//! ## States:
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Instance is excluded from routing, requests fail fast
//! - **HalfOpen**: Testing state, limited trial requests allowed
//!
//! ## Key Rust Concepts:
//! - Uses `parking_lot::Mutex` for thread-safe state sharing across async tasks
//! - Leverages `Instant` for precise timing measurements
//! - Employs `AtomicU64` for lock-free transition counters

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::error::{BalancerError, BalancerResult};

/// Configuration for circuit breaker behavior
///
/// Immutable once the breaker is constructed; a config change means
/// re-registering the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of accumulated failures before opening the circuit
    pub failure_threshold: u32,

    /// How long to stay open before a call may probe recovery
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Number of successful trial calls needed in HalfOpen to close the circuit
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> BalancerResult<()> {
        if self.failure_threshold == 0 {
            return Err(BalancerError::config("failure_threshold must be at least 1"));
        }
        if self.half_open_max_calls == 0 {
            return Err(BalancerError::config(
                "half_open_max_calls must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker state machine
///
/// Each state carries the data it needs:
/// - Closed tracks the accumulated failure count
/// - Open records when the last failure happened
/// - HalfOpen counts successful trial calls
#[derive(Debug, Clone, PartialEq)]
enum BreakerState {
    Closed { failure_count: u32 },
    Open { last_failure: Instant },
    HalfOpen { successes: u32 },
}

/// Public tag for the current breaker state, used in stats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
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
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Serializable snapshot of one breaker, exposed via `LoadBalancer::get_stats`
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub instance_id: String,
    pub state: CircuitState,
    /// Accumulated failures (meaningful while closed)
    pub failure_count: u32,
    /// Successful trial calls (meaningful while half-open)
    pub half_open_calls: u32,
    /// Calls rejected because the circuit was open
    pub rejected_calls: u64,
    /// How many times this circuit has opened
    pub opened_count: u64,
    /// Remaining open time before a trial is allowed, if currently open
    pub retry_after_ms: Option<u64>,
}

/// Per-instance failure-isolation state machine
///
/// Created and destroyed atomically with instance registration. The breaker
/// never performs I/O itself: the balancer and the health checker report
/// outcomes into it, and routing consults `can_execute` to build the eligible
/// set.
pub struct CircuitBreaker {
    /// Instance this breaker guards
    instance_id: String,

    /// Current state (mutex keeps read-modify-write sequences atomic)
    state: Mutex<BreakerState>,

    /// Immutable configuration
    config: CircuitBreakerConfig,

    /// Calls rejected while open
    rejected_calls: AtomicU64,

    /// Times the circuit has opened
    opened_count: AtomicU64,

    /// Times the circuit has closed after recovery
    closed_count: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new breaker in the Closed state
    pub fn new(instance_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            instance_id: instance_id.into(),
            state: Mutex::new(BreakerState::Closed { failure_count: 0 }),
            config,
            rejected_calls: AtomicU64::new(0),
            opened_count: AtomicU64::new(0),
            closed_count: AtomicU64::new(0),
        }
    }

    /// Create a breaker with default configuration
    pub fn with_defaults(instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, CircuitBreakerConfig::default())
    }

    /// Check whether a call may be routed to the guarded instance
    ///
    /// While Open, returns false until `recovery_timeout` has elapsed since
    /// the last failure; the first check after that transitions the breaker to
    /// HalfOpen as a side effect — there is no timer. The half-open trial
    /// budget is consumed by `record_success`, not by this check.
    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { last_failure } => {
                if last_failure.elapsed() > self.config.recovery_timeout {
                    debug!(
                        instance_id = %self.instance_id,
                        "Circuit breaker entering half-open trial"
                    );
                    *state = BreakerState::HalfOpen { successes: 0 };
                    true
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
            BreakerState::HalfOpen { successes } => {
                if successes < self.config.half_open_max_calls {
                    true
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    /// Record a successful call against the guarded instance
    ///
    /// While Closed a success pays down one accumulated failure, so a healthy
    /// trickle of traffic recovers tolerance. While HalfOpen, enough
    /// successes close the circuit and reset the failure count.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { failure_count } => {
                *state = BreakerState::Closed {
                    failure_count: failure_count.saturating_sub(1),
                };
            }
            BreakerState::Open { .. } => {
                // Late report for a call routed before the circuit opened.
            }
            BreakerState::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.config.half_open_max_calls {
                    *state = BreakerState::Closed { failure_count: 0 };
                    self.closed_count.fetch_add(1, Ordering::Relaxed);
                    info!(
                        instance_id = %self.instance_id,
                        "Circuit breaker closed after successful trial"
                    );
                } else {
                    *state = BreakerState::HalfOpen { successes };
                }
            }
        }
    }

    /// Record a failed call against the guarded instance
    ///
    /// Request failures and health-probe failures share this counter. A single
    /// failure during a half-open trial aborts the trial and reopens the
    /// circuit.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { failure_count } => {
                let failure_count = failure_count + 1;
                if failure_count >= self.config.failure_threshold {
                    *state = BreakerState::Open {
                        last_failure: Instant::now(),
                    };
                    self.opened_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        instance_id = %self.instance_id,
                        failure_count,
                        "Circuit breaker opened"
                    );
                } else {
                    *state = BreakerState::Closed { failure_count };
                }
            }
            BreakerState::Open { .. } => {
                // Already open; late failure reports carry no new information.
            }
            BreakerState::HalfOpen { .. } => {
                *state = BreakerState::Open {
                    last_failure: Instant::now(),
                };
                self.opened_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    instance_id = %self.instance_id,
                    "Circuit breaker reopened: trial call failed"
                );
            }
        }
    }

    /// Current state tag
    pub fn state(&self) -> CircuitState {
        match *self.state.lock() {
            BreakerState::Closed { .. } => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Instance this breaker guards
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The breaker's immutable configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Serializable snapshot for stats reporting
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.lock();
        let (tag, failure_count, half_open_calls, retry_after_ms) = match *state {
            BreakerState::Closed { failure_count } => (CircuitState::Closed, failure_count, 0, None),
            BreakerState::Open { last_failure } => {
                let remaining = self
                    .config
                    .recovery_timeout
                    .saturating_sub(last_failure.elapsed());
                (CircuitState::Open, 0, 0, Some(remaining.as_millis() as u64))
            }
            BreakerState::HalfOpen { successes } => (CircuitState::HalfOpen, 0, successes, None),
        };
        CircuitBreakerSnapshot {
            instance_id: self.instance_id.clone(),
            state: tag,
            failure_count,
            half_open_calls,
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            opened_count: self.opened_count.load(Ordering::Relaxed),
            retry_after_ms,
        }
    }

    /// Manually force the circuit open (admin override)
    pub fn force_open(&self) {
        let mut state = self.state.lock();
        *state = BreakerState::Open {
            last_failure: Instant::now(),
        };
        self.opened_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Manually force the circuit closed (admin override)
    pub fn force_close(&self) {
        let mut state = self.state.lock();
        *state = BreakerState::Closed { failure_count: 0 };
        self.closed_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(100),
            half_open_max_calls: 2,
        }
    }

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::with_defaults("worker-1");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let cb = CircuitBreaker::new("worker-1", fast_config());

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
        assert_eq!(cb.snapshot().rejected_calls, 1);
    }

    #[test]
    fn test_success_pays_down_failures_while_closed() {
        let cb = CircuitBreaker::new("worker-1", fast_config());

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        // Back to one accumulated failure: two more are needed to open.
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_floor_is_zero() {
        let cb = CircuitBreaker::new("worker-1", fast_config());
        cb.record_success();
        cb.record_success();
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[test]
    fn test_open_transitions_to_half_open_when_asked() {
        let cb = CircuitBreaker::new("worker-1", fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(!cb.can_execute());
        assert_eq!(cb.state(), CircuitState::Open);

        thread::sleep(Duration::from_millis(150));

        // The transition happens as a side effect of being asked.
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_enough_successes() {
        let cb = CircuitBreaker::new("worker-1", fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        thread::sleep(Duration::from_millis(150));
        assert!(cb.can_execute());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[test]
    fn test_half_open_reopens_on_single_failure() {
        let cb = CircuitBreaker::new("worker-1", fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        thread::sleep(Duration::from_millis(150));
        assert!(cb.can_execute());
        cb.record_success();

        // One failure aborts the trial regardless of accumulated successes.
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_reopened_breaker_restamps_failure_time() {
        let cb = CircuitBreaker::new("worker-1", fast_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        thread::sleep(Duration::from_millis(150));
        assert!(cb.can_execute());
        cb.record_failure();

        // Fresh stamp: the circuit stays open for a full recovery window again.
        assert!(!cb.can_execute());
        thread::sleep(Duration::from_millis(60));
        assert!(!cb.can_execute());
        thread::sleep(Duration::from_millis(90));
        assert!(cb.can_execute());
    }

    #[test]
    fn test_manual_override() {
        let cb = CircuitBreaker::with_defaults("worker-1");

        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        let bad = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
