//! The composite guard.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use mandate_rate_limiter::RateLimiter;
use mandate_types::{Clock, OpContext, Result};

use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::retry::{with_retry, RetryConfig};

/// Parameters for the composed guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Circuit breaker parameters.
    pub breaker: BreakerConfig,
    /// Retry parameters. The default budget reattempts a transient
    /// failure once.
    pub retry: RetryConfig,
    /// Bulkhead parameters.
    pub bulkhead: BulkheadConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            retry: RetryConfig {
                max_attempts: 2,
                ..Default::default()
            },
            bulkhead: BulkheadConfig::default(),
        }
    }
}

/// One guarded call path: rate-limit → bulkhead → breaker → retry → fn.
///
/// The ordering is a contract. Admission control is cheap and runs first;
/// the bulkhead caps concurrency before any failure accounting; the
/// breaker short-circuits before work is attempted; and every retry
/// attempt runs under the breaker, so repeated failures flip it open and
/// fail the remaining attempts fast. A rejection by an outer layer never
/// invokes the inner ones.
pub struct Composite {
    limiter: Option<Arc<dyn RateLimiter>>,
    bulkhead: Bulkhead,
    breaker: CircuitBreaker,
    retry: RetryConfig,
}

impl Composite {
    /// Build a guard without admission control.
    pub fn new(config: ResilienceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter: None,
            bulkhead: Bulkhead::new(config.bulkhead),
            breaker: CircuitBreaker::new(config.breaker, clock),
            retry: config.retry,
        }
    }

    /// Attach per-subject admission control.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// The breaker guarding this call path.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The bulkhead guarding this call path.
    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    /// Run `f` through the full guard stack, keyed by `subject` for
    /// admission control.
    pub async fn execute<T, F, Fut>(&self, ctx: &OpContext, subject: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        ctx.check()?;

        if let Some(limiter) = &self.limiter {
            if let Some(err) = limiter.allow(subject).to_error() {
                return Err(err);
            }
        }

        let permit = self.bulkhead.acquire(ctx).await?;
        let out = with_retry(&self.retry, ctx, "guarded-call", |_attempt| {
            // Build the attempt future lazily; it only runs if the breaker
            // admits the attempt.
            let attempt = f();
            async move {
                let guard = self.breaker.try_acquire()?;
                match ctx.run(attempt).await {
                    Ok(value) => {
                        guard.success();
                        Ok(value)
                    }
                    Err(err) if err.is_cancellation() => {
                        guard.cancelled();
                        Err(err)
                    }
                    Err(err) => {
                        guard.failure();
                        Err(err)
                    }
                }
            }
        })
        .await;
        drop(permit);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mandate_rate_limiter::{Algorithm, FixedWindowLimiter, RateLimitConfig};
    use mandate_types::{Error, ManualClock};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fixture(limit: Option<u64>) -> (Composite, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = ResilienceConfig {
            breaker: BreakerConfig {
                failure_threshold: 3,
                success_threshold: 1,
                open_duration: Duration::from_secs(30),
                probe_concurrency: 1,
            },
            retry: RetryConfig {
                max_attempts: 2,
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(1),
                multiplier: 1.0,
            },
            bulkhead: BulkheadConfig { max_concurrent: 4 },
        };
        let mut composite = Composite::new(config, clock.clone());
        if let Some(limit) = limit {
            let limiter = FixedWindowLimiter::new(
                &RateLimitConfig {
                    algorithm: Algorithm::Fixed,
                    limit,
                    window: Duration::from_secs(60),
                    rps: 0.0,
                    burst: 0,
                },
                clock.clone(),
            )
            .unwrap();
            composite = composite.with_rate_limiter(Arc::new(limiter));
        }
        (composite, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_passes_through() {
        let (composite, _clock) = fixture(None);
        let out = composite
            .execute(&OpContext::background(), "s", || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rejection_never_invokes_inner_layers() {
        let (composite, _clock) = fixture(Some(1));
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = calls.clone();
        composite
            .execute(&OpContext::background(), "s", move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let calls3 = calls.clone();
        let denied = composite
            .execute(&OpContext::background(), "s", move || {
                let calls = calls3.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(denied, Err(Error::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(composite.bulkhead().available(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_once() {
        let (composite, _clock) = fixture(None);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let out = composite
            .execute(&OpContext::background(), "s", move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::unavailable("first attempt"))
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_flip_the_breaker_open() {
        let (composite, _clock) = fixture(None);
        let calls = Arc::new(AtomicU32::new(0));

        // First call: two attempts, two recorded failures.
        let calls2 = calls.clone();
        let first = composite
            .execute(&OpContext::background(), "s", move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::unavailable("down"))
                }
            })
            .await;
        assert!(matches!(first, Err(Error::Unavailable { .. })));

        // Second call: third failure trips the breaker; the retry attempt
        // after it fails fast with CircuitOpen.
        let calls3 = calls.clone();
        let second = composite
            .execute(&OpContext::background(), "s", move || {
                let calls = calls3.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::unavailable("down"))
                }
            })
            .await;
        assert_eq!(second, Err(Error::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Third call: fails fast without invoking the op at all.
        let calls4 = calls.clone();
        let third = composite
            .execute(&OpContext::background(), "s", move || {
                let calls = calls4.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert_eq!(third, Err(Error::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_context_rejects_before_any_layer() {
        let (composite, _clock) = fixture(Some(100));
        let ctx = OpContext::background();
        ctx.cancel();
        let out = composite
            .execute(&ctx, "s", || async { Ok(()) })
            .await;
        assert_eq!(out, Err(Error::Cancelled));
    }
}
