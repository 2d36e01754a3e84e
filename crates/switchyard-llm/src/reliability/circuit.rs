//! Circuit breaker that stops calls to a backend that keeps failing.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use switchyard_core::FieldError;
use tracing::{info, warn};

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing trial calls, in
    /// milliseconds.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Trial calls allowed while half-open.
    #[serde(default = "default_half_open_max")]
    pub half_open_max: u32,
    /// A closed circuit forgets its failures after this long without a new
    /// one, in milliseconds. `0` disables forgetting.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max() -> u32 {
    1
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max: default_half_open_max(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl CircuitConfig {
    /// Opens quickly and stays open longer.
    pub fn strict() -> Self {
        Self {
            failure_threshold: 2,
            recovery_timeout_ms: 60_000,
            half_open_max: 1,
            reset_timeout_ms: 120_000,
        }
    }

    /// Tolerates more failures.
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout_ms: 15_000,
            half_open_max: 2,
            reset_timeout_ms: 30_000,
        }
    }

    /// Field errors, prefixed with `prefix`.
    pub fn validate(&self, prefix: &str) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.failure_threshold == 0 {
            errors.push(FieldError::new(
                format!("{prefix}.failure_threshold"),
                "must be at least 1",
            ));
        }
        if self.half_open_max == 0 {
            errors.push(FieldError::new(
                format!("{prefix}.half_open_max"),
                "must be at least 1",
            ));
        }
        errors
    }
}

/// The current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation. All calls are allowed.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// A bounded number of trial calls are allowed.
    HalfOpen,
}

struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
}

/// Tracks consecutive failures of one backend and blocks calls while it is
/// considered down.
///
/// ```text
/// CLOSED ──[failure_threshold]──► OPEN ──[recovery_timeout]──► HALF-OPEN
///   ▲                              ▲                               │
///   │                              └─────────[trial failure]───────┤
///   └──────────────────────────[trial success]─────────────────────┘
/// ```
///
/// State lives under one mutex shared by every caller of the wrapper.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// A closed breaker guarding `name`.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                opened_at: None,
                trials_in_flight: 0,
            }),
        }
    }

    /// The configuration in force.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state, without side effects.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures counted while closed.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Asks permission for one call.
    ///
    /// Closed always allows. Open allows nothing until the recovery timeout
    /// has elapsed, then turns half-open and admits the caller as the first
    /// trial. Half-open admits up to `half_open_max` trials at a time.
    pub fn try_acquire(&self) -> bool {
        let mut st = self.inner.lock();
        match st.state {
            CircuitState::Closed => {
                let reset = Duration::from_millis(self.config.reset_timeout_ms);
                if self.config.reset_timeout_ms > 0
                    && st.failures > 0
                    && st.last_failure.is_some_and(|t| t.elapsed() >= reset)
                {
                    st.failures = 0;
                }
                true
            }
            CircuitState::Open => {
                let recovery = Duration::from_millis(self.config.recovery_timeout_ms);
                if st.opened_at.is_some_and(|t| t.elapsed() >= recovery) {
                    st.state = CircuitState::HalfOpen;
                    st.trials_in_flight = 1;
                    info!(provider = %self.name, "circuit half-open, allowing trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if st.trials_in_flight < self.config.half_open_max {
                    st.trials_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), but the slot is tied to the
    /// returned permit. A permit dropped without an outcome, for example when
    /// the caller's future is cancelled, is recorded as neutral.
    pub fn acquire(&self) -> Option<BreakerPermit<'_>> {
        self.try_acquire().then_some(BreakerPermit {
            breaker: self,
            settled: false,
        })
    }

    /// Records a successful call. A half-open circuit closes.
    pub fn record_success(&self) {
        let mut st = self.inner.lock();
        st.failures = 0;
        st.last_failure = None;
        if st.state == CircuitState::HalfOpen {
            st.state = CircuitState::Closed;
            st.trials_in_flight = 0;
            st.opened_at = None;
            info!(provider = %self.name, "circuit closed after successful trial");
        }
    }

    /// Records a failed call. A closed circuit opens at the threshold; a
    /// half-open one reopens and restarts the recovery timeout.
    pub fn record_failure(&self) {
        let mut st = self.inner.lock();
        let now = Instant::now();
        match st.state {
            CircuitState::Closed => {
                st.failures += 1;
                st.last_failure = Some(now);
                if st.failures >= self.config.failure_threshold {
                    st.state = CircuitState::Open;
                    st.opened_at = Some(now);
                    warn!(
                        provider = %self.name,
                        failures = st.failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                st.state = CircuitState::Open;
                st.opened_at = Some(now);
                st.trials_in_flight = 0;
                warn!(provider = %self.name, "trial call failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Records a call that failed for reasons unrelated to backend health,
    /// such as a rejected request. Frees a trial slot without changing state.
    pub fn record_neutral(&self) {
        let mut st = self.inner.lock();
        if st.state == CircuitState::HalfOpen {
            st.trials_in_flight = st.trials_in_flight.saturating_sub(1);
        }
    }

    /// Forces the circuit closed with a zeroed counter.
    pub fn reset(&self) {
        let mut st = self.inner.lock();
        st.state = CircuitState::Closed;
        st.failures = 0;
        st.last_failure = None;
        st.opened_at = None;
        st.trials_in_flight = 0;
    }
}

/// One admitted call. Consume it with the call's outcome.
#[must_use = "dropping a permit records a neutral outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// See [`CircuitBreaker::record_success`].
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// See [`CircuitBreaker::record_failure`].
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }

    /// See [`CircuitBreaker::record_neutral`].
    pub fn neutral(mut self) {
        self.settled = true;
        self.breaker.record_neutral();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_neutral();
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &st.state)
            .field("failures", &st.failures)
            .finish()
    }
}
