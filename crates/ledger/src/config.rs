//! Configuration for the JSON-RPC ledger client.
//!
//! [`RpcLedgerConfig`] names the node and the contract and bounds every call;
//! [`RetryConfig`] shapes the backoff applied to transient failures.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use pharmatrace_ledger::RpcLedgerConfig;
//!
//! let config = RpcLedgerConfig::builder()
//!     .endpoint("http://127.0.0.1:8545")
//!     .contract_address("0x5FbDB2315678afecb367f032d93F642f64180aa3")
//!     .call_timeout(Duration::from_secs(5))
//!     .build()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;

use pharmatrace_store::ConfigError;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;

/// Default gas budget attached to every submission.
pub const DEFAULT_GAS_LIMIT: u64 = 3_000_000;

/// Default per-call timeout, covering every retry of one call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between `eth_getLogs` polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default capacity of the channel between the poll task and the subscriber.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

/// Default maximum number of retries for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default initial backoff between retries.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default cap on the backoff between retries.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Backoff policy for transient ledger failures.
///
/// The delay before retry `n` is `min(initial_backoff * 2^n, max_backoff)`
/// plus up to 50% random jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub(crate) max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub(crate) initial_backoff: Duration,
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub(crate) max_backoff: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[bon::bon]
impl RetryConfig {
    /// Creates a new retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `initial_backoff` exceeds
    /// `max_backoff`. A `max_retries` of zero disables retries.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_MAX_BACKOFF)] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        if initial_backoff > max_backoff {
            return Err(ConfigError::Invalid {
                field: "initial_backoff",
                reason: format!("{initial_backoff:?} exceeds max_backoff {max_backoff:?}"),
            });
        }
        Ok(Self { max_retries, initial_backoff, max_backoff })
    }

    /// Returns the maximum number of retries.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the initial backoff.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the backoff cap.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

/// Connection settings for [`RpcLedgerClient`](crate::RpcLedgerClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcLedgerConfig {
    /// JSON-RPC endpoint URL.
    pub(crate) endpoint: String,

    /// Address of the drug registry contract.
    pub(crate) contract_address: String,

    /// Gas budget attached to submissions.
    #[serde(default = "default_gas_limit")]
    pub(crate) gas_limit: u64,

    /// Upper bound on one call including its retries.
    #[serde(with = "humantime_serde", default = "default_call_timeout")]
    pub(crate) call_timeout: Duration,

    /// Interval between log polls.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub(crate) poll_interval: Duration,

    /// Capacity of each subscription's channel.
    #[serde(default = "default_subscription_buffer")]
    pub(crate) subscription_buffer: usize,

    /// Retry policy for transient failures.
    #[serde(default)]
    pub(crate) retry: RetryConfig,

    /// Circuit breaker settings.
    #[serde(default)]
    pub(crate) circuit_breaker: CircuitBreakerConfig,
}

fn default_gas_limit() -> u64 {
    DEFAULT_GAS_LIMIT
}

fn default_call_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_subscription_buffer() -> usize {
    DEFAULT_SUBSCRIPTION_BUFFER
}

#[bon::bon]
impl RpcLedgerConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `endpoint` is not an `http(s)` URL
    /// - `contract_address` is not a 20-byte hex address
    /// - `gas_limit`, `call_timeout`, `poll_interval` or `subscription_buffer` is zero
    #[builder]
    pub fn new(
        #[builder(into)] endpoint: String,
        #[builder(into)] contract_address: String,
        #[builder(default = DEFAULT_GAS_LIMIT)] gas_limit: u64,
        #[builder(default = DEFAULT_CALL_TIMEOUT)] call_timeout: Duration,
        #[builder(default = DEFAULT_POLL_INTERVAL)] poll_interval: Duration,
        #[builder(default = DEFAULT_SUBSCRIPTION_BUFFER)] subscription_buffer: usize,
        #[builder(default)] retry: RetryConfig,
        #[builder(default)] circuit_breaker: CircuitBreakerConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            endpoint,
            contract_address,
            gas_limit,
            call_timeout,
            poll_interval,
            subscription_buffer,
            retry,
            circuit_breaker,
        };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Same conditions as the builder.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "endpoint",
                reason: format!("expected an http(s) URL, got {:?}", self.endpoint),
            });
        }
        let address = self.contract_address.strip_prefix("0x").unwrap_or(&self.contract_address);
        if address.len() != 40 || !address.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ConfigError::Invalid {
                field: "contract_address",
                reason: format!("expected a 20-byte hex address, got {:?}", self.contract_address),
            });
        }
        if self.gas_limit == 0 {
            return Err(ConfigError::MustBePositive { field: "gas_limit", value: "0".into() });
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "call_timeout", value: "0s".into() });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::MustBePositive { field: "poll_interval", value: "0s".into() });
        }
        if self.subscription_buffer == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "subscription_buffer",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Returns the endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the contract address.
    #[must_use]
    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    /// Returns the gas budget.
    #[must_use]
    pub fn gas_limit(&self) -> u64 {
        self.gas_limit
    }

    /// Returns the per-call timeout.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Returns the poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
