//! Optimistic concurrency retry for read-modify-write cycles.
//!
//! Every record mutation reads a document, computes the new value and writes
//! it back with a compare-and-swap conditioned on the bytes it read. When
//! another writer got there first the backend reports
//! [`StorageError::Conflict`] and [`with_cas_retry`] re-runs the whole cycle
//! after a jittered delay.

use std::{future::Future, time::Duration};

use fail::fail_point;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StorageError, StorageResult};

/// Default number of retries after the first conflicting attempt.
pub const DEFAULT_CAS_MAX_RETRIES: u32 = 16;

/// Default base delay between conflicting attempts.
pub const DEFAULT_CAS_RETRY_BASE_DELAY: Duration = Duration::from_millis(2);

/// Retry policy for compare-and-swap conflicts.
///
/// Between attempts the loop sleeps `base_delay + random(0..=base_delay)`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use pharmatrace_store::CasRetryConfig;
///
/// let config = CasRetryConfig::builder()
///     .max_retries(4)
///     .base_delay(Duration::from_millis(1))
///     .build()
///     .unwrap();
/// assert_eq!(config.max_retries(), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CasRetryConfig {
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    base_delay: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_CAS_MAX_RETRIES
}

fn default_base_delay() -> Duration {
    DEFAULT_CAS_RETRY_BASE_DELAY
}

impl Default for CasRetryConfig {
    fn default() -> Self {
        Self { max_retries: DEFAULT_CAS_MAX_RETRIES, base_delay: DEFAULT_CAS_RETRY_BASE_DELAY }
    }
}

#[bon::bon]
impl CasRetryConfig {
    /// Creates a new CAS retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `max_retries` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CAS_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_CAS_RETRY_BASE_DELAY)] base_delay: Duration,
    ) -> Result<Self, ConfigError> {
        if max_retries == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_retries",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(Self { max_retries, base_delay })
    }

    /// Returns the maximum number of retries.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the base delay between attempts.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    fn jittered_delay(&self) -> Duration {
        let range = self.base_delay.as_millis() as u64;
        if range == 0 {
            return self.base_delay;
        }
        self.base_delay + Duration::from_millis(rand::rng().random_range(0..=range))
    }
}

/// Retries a read-modify-write cycle on CAS conflict.
///
/// The `operation` closure performs the full cycle: read the current
/// document, compute the mutation and write it back conditionally. On
/// [`StorageError::Conflict`] the closure is re-invoked up to
/// `config.max_retries` times. Any other error is returned immediately.
///
/// # Errors
///
/// Returns [`StorageError::CasRetriesExhausted`] when every attempt
/// conflicted.
#[tracing::instrument(skip(config, operation), fields(max_retries = config.max_retries))]
pub async fn with_cas_retry<F, Fut, T>(config: &CasRetryConfig, mut operation: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt = attempt + 1, "CAS cycle succeeded after conflict");
                }
                return Ok(value);
            },
            Err(StorageError::Conflict { id }) if attempt < config.max_retries => {
                let delay = config.jittered_delay();
                tracing::debug!(
                    id = %id,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "CAS conflict, retrying after jitter",
                );
                fail_point!("cas-retry-before-sleep");
                tokio::time::sleep(delay).await;
            },
            Err(StorageError::Conflict { id }) => {
                tracing::warn!(id = %id, attempts = config.max_retries + 1, "CAS retries exhausted");
                return Err(StorageError::cas_retries_exhausted(config.max_retries + 1));
            },
            Err(e) => return Err(e),
        }
    }

    Err(StorageError::cas_retries_exhausted(config.max_retries + 1))
}
