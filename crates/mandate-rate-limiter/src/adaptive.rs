//! Adaptive limit scaling.
//!
//! Wraps any [`RateLimiter`] that is also [`AdjustableLimit`] and retunes
//! its limit from observed usage: after each window the usage ratio is
//! pushed into a rolling history; a high mean scales the limit down, a low
//! mean scales it up, always clamped to `[min, max]`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use mandate_types::Clock;

use crate::{AdjustableLimit, Quota, RateLimitResult, RateLimiter};

/// Number of trailing windows the usage history covers.
const HISTORY_WINDOWS: usize = 10;

/// Mean usage ratio above which the limit is scaled down.
const SCALE_DOWN_THRESHOLD: f64 = 0.8;

/// Mean usage ratio below which the limit is scaled up.
const SCALE_UP_THRESHOLD: f64 = 0.5;

/// Adaptive wrapper parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Lower clamp for the dynamic limit.
    pub min: u64,
    /// Upper clamp for the dynamic limit.
    pub max: u64,
    /// Multiplier applied when scaling up.
    #[serde(rename = "scaleUp")]
    pub scale_up: f64,
    /// Multiplier applied when scaling down.
    #[serde(rename = "scaleDown")]
    pub scale_down: f64,
    /// Observation window length.
    pub window: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min: 10,
            max: 1000,
            scale_up: 1.1,
            scale_down: 0.9,
            window: Duration::from_secs(60),
        }
    }
}

struct AdaptiveState {
    window_start: Duration,
    used: u64,
    history: VecDeque<f64>,
}

/// Dynamic-limit wrapper around an adjustable limiter.
pub struct AdaptiveLimiter<L> {
    inner: L,
    config: AdaptiveConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<AdaptiveState>,
}

impl<L: RateLimiter + AdjustableLimit> AdaptiveLimiter<L> {
    /// Wrap `inner`, clamping its starting limit into `[min, max]`.
    pub fn new(inner: L, config: AdaptiveConfig, clock: Arc<dyn Clock>) -> Self {
        let start = inner.current_limit().clamp(config.min, config.max);
        inner.set_limit(start);
        Self {
            inner,
            config,
            state: Mutex::new(AdaptiveState {
                window_start: clock.monotonic(),
                used: 0,
                history: VecDeque::with_capacity(HISTORY_WINDOWS),
            }),
            clock,
        }
    }

    /// The wrapped limiter.
    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// Roll the observation window if it has elapsed, retuning the limit.
    fn roll_window(&self, now: Duration) {
        let mut state = self.state.lock();
        if now.saturating_sub(state.window_start) < self.config.window {
            return;
        }

        let limit = self.inner.current_limit();
        let ratio = if limit == 0 {
            0.0
        } else {
            state.used as f64 / limit as f64
        };
        if state.history.len() == HISTORY_WINDOWS {
            state.history.pop_front();
        }
        state.history.push_back(ratio);

        let mean: f64 = state.history.iter().sum::<f64>() / state.history.len() as f64;
        let retuned = if mean > SCALE_DOWN_THRESHOLD {
            (limit as f64 * self.config.scale_down).round() as u64
        } else if mean < SCALE_UP_THRESHOLD {
            (limit as f64 * self.config.scale_up).round() as u64
        } else {
            limit
        }
        .clamp(self.config.min, self.config.max);

        if retuned != limit {
            debug!(limit, retuned, mean, "adaptive limit retuned");
            self.inner.set_limit(retuned);
        }

        state.used = 0;
        state.window_start = now;
    }
}

impl<L: RateLimiter + AdjustableLimit> RateLimiter for AdaptiveLimiter<L> {
    fn allow(&self, subject: &str) -> RateLimitResult {
        let now = self.clock.monotonic();
        self.roll_window(now);
        let result = self.inner.allow(subject);
        if result.is_allowed() {
            self.state.lock().used += 1;
        }
        result
    }

    fn quota(&self, subject: &str) -> Quota {
        self.inner.quota(subject)
    }

    fn reset(&self, subject: &str) {
        self.inner.reset(subject);
    }

    fn sweep(&self) {
        self.inner.sweep();
    }
}

impl<L: RateLimiter + AdjustableLimit> AdjustableLimit for AdaptiveLimiter<L> {
    fn current_limit(&self) -> u64 {
        self.inner.current_limit()
    }

    fn set_limit(&self, limit: u64) {
        self.inner
            .set_limit(limit.clamp(self.config.min, self.config.max));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Algorithm, FixedWindowLimiter, RateLimitConfig};
    use mandate_types::ManualClock;

    fn fixture(limit: u64, min: u64, max: u64) -> (AdaptiveLimiter<FixedWindowLimiter>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let inner = FixedWindowLimiter::new(
            &RateLimitConfig {
                algorithm: Algorithm::Fixed,
                limit,
                window: Duration::from_secs(10),
                rps: 0.0,
                burst: 0,
            },
            clock.clone(),
        )
        .unwrap();
        let adaptive = AdaptiveLimiter::new(
            inner,
            AdaptiveConfig {
                min,
                max,
                scale_up: 1.1,
                scale_down: 0.9,
                window: Duration::from_secs(10),
            },
            clock.clone(),
        );
        (adaptive, clock)
    }

    #[test]
    fn heavy_usage_scales_down() {
        let (limiter, clock) = fixture(100, 10, 1000);

        // Saturate the window: ratio 1.0 > 0.8.
        for _ in 0..100 {
            assert!(limiter.allow("s").is_allowed());
        }
        clock.advance(Duration::from_secs(10));
        limiter.allow("s");
        assert_eq!(limiter.current_limit(), 90);
    }

    #[test]
    fn light_usage_scales_up() {
        let (limiter, clock) = fixture(100, 10, 1000);

        // Ratio 0.02 < 0.5.
        limiter.allow("s");
        limiter.allow("s");
        clock.advance(Duration::from_secs(10));
        limiter.allow("s");
        assert_eq!(limiter.current_limit(), 110);
    }

    #[test]
    fn limit_clamps_to_bounds() {
        let (limiter, clock) = fixture(100, 95, 1000);

        for round in 0..4 {
            let limit = limiter.current_limit();
            for _ in 0..limit {
                limiter.allow("s");
            }
            clock.advance(Duration::from_secs(10));
            limiter.allow("s");
            assert!(limiter.current_limit() >= 95, "round {round}");
        }
        assert_eq!(limiter.current_limit(), 95);
    }

    #[test]
    fn mean_over_history_not_last_window() {
        let (limiter, clock) = fixture(100, 10, 1000);

        // Five saturated windows then one idle one: mean stays > 0.8 only
        // while the history says so.
        for _ in 0..3 {
            let limit = limiter.current_limit();
            for _ in 0..limit {
                limiter.allow("s");
            }
            clock.advance(Duration::from_secs(10));
        }
        limiter.allow("s");
        let after_heavy = limiter.current_limit();
        assert!(after_heavy < 100);

        // An idle window pulls the mean below the scale-down threshold.
        clock.advance(Duration::from_secs(10));
        limiter.allow("s");
        assert!(limiter.current_limit() >= after_heavy);
    }
}
