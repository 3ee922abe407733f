//! Exponential-backoff retry engine.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use mandate_types::{Error, OpContext, Result};

/// Retry parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first (1 disables retries).
    pub max_attempts: u32,
    /// Backoff before the first reattempt.
    pub initial_interval: Duration,
    /// Backoff ceiling.
    pub max_interval: Duration,
    /// Interval growth factor per reattempt.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Run `f` with bounded exponential-backoff reattempts.
///
/// `f` receives the 1-based attempt number. Cancellation and deadline
/// expiry abort immediately (a timed-out attempt counts as a single
/// attempt and does not reset the backoff); errors the taxonomy marks
/// non-retryable are returned as-is; otherwise the engine sleeps the
/// current interval (itself cancellable), grows it by `multiplier` up to
/// `max_interval`, and tries again until `max_attempts` is exhausted. The
/// last error is returned.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    ctx: &OpContext,
    name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut interval = config.initial_interval;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        ctx.check()?;

        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if attempt >= max_attempts {
                    debug!(operation = name, attempt, "retry attempts exhausted");
                    return Err(err);
                }
                debug!(
                    operation = name,
                    attempt,
                    delay_ms = interval.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                ctx.sleep(interval).await?;
                interval = interval
                    .mul_f64(config.multiplier.max(1.0))
                    .min(config.max_interval);
            }
        }
    }
}
