//! Circuit breaker in front of the ledger node.
//!
//! During a sustained node outage every call would otherwise spend its whole
//! timeout retrying. The breaker counts consecutive transient failures, then
//! rejects calls immediately until a recovery window has passed, and lets a
//! few probe calls through to detect recovery.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐  failure_threshold  ┌──────┐  recovery_timeout  ┌──────────┐
//! │ Closed │ ──────exceeded────→ │ Open │ ────elapsed─────→  │ HalfOpen │
//! └────────┘                     └──────┘ ←──probe fails──── └──────────┘
//!      ↑                                                          │
//!      └──────────────── success_threshold met ───────────────────┘
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use pharmatrace_store::ConfigError;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// Default number of consecutive failures before opening the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default duration the circuit stays open before probing.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of successful probes required to close the circuit.
pub const DEFAULT_HALF_OPEN_SUCCESS_THRESHOLD: u32 = 2;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until `until`.
    Open {
        /// When probing may start.
        until: Instant,
    },
    /// Probe calls pass through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open { .. } => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    failure_threshold: u32,
    #[serde(with = "humantime_serde", default = "default_recovery_timeout")]
    recovery_timeout: Duration,
    #[serde(default = "default_half_open_success_threshold")]
    half_open_success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_recovery_timeout() -> Duration {
    DEFAULT_RECOVERY_TIMEOUT
}

fn default_half_open_success_threshold() -> u32 {
    DEFAULT_HALF_OPEN_SUCCESS_THRESHOLD
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            half_open_success_threshold: DEFAULT_HALF_OPEN_SUCCESS_THRESHOLD,
        }
    }
}

#[bon::bon]
impl CircuitBreakerConfig {
    /// Creates a new circuit breaker configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any threshold or the recovery timeout is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_FAILURE_THRESHOLD)] failure_threshold: u32,
        #[builder(default = DEFAULT_RECOVERY_TIMEOUT)] recovery_timeout: Duration,
        #[builder(default = DEFAULT_HALF_OPEN_SUCCESS_THRESHOLD)] half_open_success_threshold: u32,
    ) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "failure_threshold",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if recovery_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "recovery_timeout",
                value: "0s".into(),
            });
        }
        if half_open_success_threshold == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "half_open_success_threshold",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(Self { failure_threshold, recovery_timeout, half_open_success_threshold })
    }

    /// Returns the failure threshold.
    #[must_use]
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Returns the recovery timeout.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Returns the half-open success threshold.
    #[must_use]
    pub fn half_open_success_threshold(&self) -> u32 {
        self.half_open_success_threshold
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    config: CircuitBreakerConfig,
    state_transitions: u64,
    fast_fail_count: u64,
}

impl Inner {
    fn transition(&mut self, to: CircuitState) {
        tracing::info!(from = %self.state, to = %to, "ledger circuit breaker transition");
        self.state = to;
        self.state_transitions += 1;
    }

    fn open(&mut self) {
        let until = Instant::now() + self.config.recovery_timeout;
        self.half_open_successes = 0;
        self.transition(CircuitState::Open { until });
    }
}

/// Thread-safe circuit breaker, cheaply cloneable.
///
/// Critical sections never span I/O.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<Mutex<Inner>>,
}

/// A snapshot of circuit breaker counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Current state.
    pub state: CircuitState,
    /// State transitions since creation.
    pub state_transitions: u64,
    /// Calls rejected while open.
    pub fast_fail_count: u64,
    /// Current consecutive failure count.
    pub consecutive_failures: u32,
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                config,
                state_transitions: 0,
                fast_fail_count: 0,
            })),
        }
    }

    /// Admits or rejects a call.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Unavailable`] while the circuit is open.
    pub fn check(&self) -> LedgerResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { until } if Instant::now() >= until => {
                inner.half_open_successes = 0;
                inner.transition(CircuitState::HalfOpen);
                Ok(())
            },
            CircuitState::Open { .. } => {
                inner.fast_fail_count += 1;
                Err(LedgerError::unavailable("circuit open: ledger node failing"))
            },
        }
    }

    /// Feeds the outcome of an admitted call back into the breaker.
    ///
    /// Only transient errors count as failures; a rejected transaction proves
    /// the node is healthy.
    pub fn record<T>(&self, result: &LedgerResult<T>) {
        match result {
            Err(err) if err.is_transient() => self.record_failure(),
            _ => self.record_success(),
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= inner.config.half_open_success_threshold {
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.transition(CircuitState::Closed);
                }
            },
            CircuitState::Open { .. } => {},
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= inner.config.failure_threshold {
                    tracing::warn!(
                        consecutive_failures = inner.consecutive_failures,
                        "ledger node failing, opening circuit"
                    );
                    inner.open();
                }
            },
            CircuitState::HalfOpen => inner.open(),
            CircuitState::Open { .. } => {},
        }
    }

    /// Returns the current state without transitioning.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match self.inner.lock().state {
            CircuitState::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            other => other,
        }
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state();
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state,
            state_transitions: inner.state_transitions,
            fast_fail_count: inner.fast_fail_count,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}
