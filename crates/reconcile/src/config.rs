//! Event sync engine configuration.

use std::time::Duration;

use pharmatrace_store::ConfigError;
use serde::{Deserialize, Serialize};

/// Default delay before the first reconnect attempt.
pub const DEFAULT_RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Default cap on the reconnect delay.
pub const DEFAULT_RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Settings for [`EventSyncEngine`](crate::EventSyncEngine).
///
/// The delay before reconnect attempt `n` is
/// `min(initial_backoff * 2^n, max_backoff)`; `n` resets once a subscription
/// reaches `Listening`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    initial_backoff: Duration,
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    max_backoff: Duration,
    /// Block to start from on the first subscription; latest when unset.
    #[serde(default)]
    start_block: Option<u64>,
}

fn default_initial_backoff() -> Duration {
    DEFAULT_RECONNECT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_RECONNECT_MAX_BACKOFF
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_RECONNECT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_RECONNECT_MAX_BACKOFF,
            start_block: None,
        }
    }
}

#[bon::bon]
impl SyncConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `initial_backoff` is zero or exceeds
    /// `max_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_RECONNECT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_RECONNECT_MAX_BACKOFF)] max_backoff: Duration,
        start_block: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let config = Self { initial_backoff, max_backoff, start_block };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Same conditions as the builder.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::MustBePositive { field: "initial_backoff", value: "0s".into() });
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::Invalid {
                field: "initial_backoff",
                reason: format!("{:?} exceeds max_backoff {:?}", self.initial_backoff, self.max_backoff),
            });
        }
        Ok(())
    }

    /// Returns the first reconnect delay.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the reconnect delay cap.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Returns the configured start block.
    #[must_use]
    pub fn start_block(&self) -> Option<u64> {
        self.start_block
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}
