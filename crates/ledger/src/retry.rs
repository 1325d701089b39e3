//! Retry with backoff and an overall deadline for ledger calls.
//!
//! Callers choose which failures are retried: reads pass
//! [`LedgerError::is_transient`], submissions pass
//! [`LedgerError::is_unsent`] so a transaction the node may have accepted is
//! never sent twice. Retries use exponential backoff with jitter:
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0–50% of the computed delay is added
//!
//! [`with_retry_timeout`] bounds the whole loop, sleeps included, so a caller
//! never waits longer than the configured call timeout.

use std::{future::Future, time::Duration};

use fail::fail_point;
use rand::Rng;

use crate::{
    config::RetryConfig,
    error::{LedgerError, LedgerResult},
};

/// Runs `operation`, retrying failures accepted by `retryable` according to
/// `config`.
#[tracing::instrument(skip(config, retryable, operation), fields(max_retries = config.max_retries))]
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    method: &str,
    retryable: fn(&LedgerError) -> bool,
    mut operation: F,
) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(method, attempt = attempt + 1, "ledger call succeeded after retry");
                }
                return Ok(value);
            },
            Err(err) if retryable(&err) && attempt < config.max_retries => {
                let delay = compute_backoff(config, attempt);
                tracing::debug!(
                    method,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient ledger error, retrying after backoff",
                );
                fail_point!("ledger-retry-before-sleep");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => return Err(err),
        }
    }
}

/// Like [`with_retry`], bounded by `timeout` overall.
///
/// # Errors
///
/// [`LedgerError::Unavailable`] when the deadline passes first.
pub(crate) async fn with_retry_timeout<F, Fut, T>(
    config: &RetryConfig,
    timeout: Duration,
    method: &str,
    retryable: fn(&LedgerError) -> bool,
    operation: F,
) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    match tokio::time::timeout(timeout, with_retry(config, method, retryable, operation)).await {
        Ok(result) => result,
        Err(_elapsed) => {
            tracing::warn!(method, timeout_ms = timeout.as_millis() as u64, "ledger call timed out");
            Err(LedgerError::unavailable(format!("{method} timed out after {timeout:?}")))
        },
    }
}

/// `min(initial_backoff * 2^attempt, max_backoff) + random(0..50% of delay)`
pub(crate) fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff);

    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        capped + Duration::from_millis(rand::rng().random_range(0..=jitter_range))
    } else {
        capped
    }
}
