//! The three bundled rate limiting algorithms.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use mandate_types::Clock;

use crate::{
    AdjustableLimit, Quota, RateLimitConfig, RateLimitError, RateLimitResult, RateLimiter,
    WindowUsage,
};

/// Subjects idle this many windows are evicted by `sweep`.
const IDLE_WINDOWS: u32 = 2;

fn wall_window_start(clock: &dyn Clock, elapsed_in_window: Duration) -> chrono::DateTime<chrono::Utc> {
    clock.wall()
        - chrono::Duration::from_std(elapsed_in_window).unwrap_or_else(|_| chrono::Duration::zero())
}

//─────────────────────────────
//  Fixed window
//─────────────────────────────

#[derive(Debug)]
struct FixedState {
    count: u64,
    window_start: Duration,
    last_seen: Duration,
}

/// Counter reset at fixed window boundaries.
///
/// Cheapest of the three; admits up to `limit` requests per window and
/// resets the counter when a full window has elapsed since the window
/// start.
pub struct FixedWindowLimiter {
    limit: AtomicU64,
    window: Duration,
    clock: Arc<dyn Clock>,
    subjects: DashMap<String, FixedState>,
}

impl FixedWindowLimiter {
    /// Build from config; `limit` and `window` must be positive.
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self, RateLimitError> {
        if config.limit == 0 {
            return Err(RateLimitError::InvalidConfig("limit must be positive".into()));
        }
        if config.window.is_zero() {
            return Err(RateLimitError::InvalidConfig("window must be positive".into()));
        }
        Ok(Self {
            limit: AtomicU64::new(config.limit),
            window: config.window,
            clock,
            subjects: DashMap::new(),
        })
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn allow(&self, subject: &str) -> RateLimitResult {
        let now = self.clock.monotonic();
        let limit = self.limit.load(Ordering::Relaxed);

        let mut state = self
            .subjects
            .entry(subject.to_owned())
            .or_insert_with(|| FixedState {
                count: 0,
                window_start: now,
                last_seen: now,
            });
        state.last_seen = now;

        if now.saturating_sub(state.window_start) >= self.window {
            state.count = 0;
            state.window_start = now;
        }

        let elapsed = now.saturating_sub(state.window_start);
        let reset_after = self.window.saturating_sub(elapsed);
        if state.count < limit {
            state.count += 1;
            RateLimitResult::Allowed {
                remaining: limit - state.count,
                reset_after,
                limit,
            }
        } else {
            debug!(subject, limit, "fixed window limit exceeded");
            RateLimitResult::Exceeded {
                retry_after: reset_after,
                limit,
                current_usage: state.count,
            }
        }
    }

    fn quota(&self, subject: &str) -> Quota {
        let now = self.clock.monotonic();
        let limit = self.limit.load(Ordering::Relaxed);
        let (used, elapsed) = match self.subjects.get(subject) {
            Some(state) if now.saturating_sub(state.window_start) < self.window => {
                (state.count, now.saturating_sub(state.window_start))
            }
            _ => (0, Duration::ZERO),
        };
        Quota {
            total: limit,
            remaining: limit.saturating_sub(used),
            reset_after: self.window.saturating_sub(elapsed),
            window: WindowUsage {
                start: wall_window_start(&*self.clock, elapsed),
                duration: self.window,
                used,
            },
        }
    }

    fn reset(&self, subject: &str) {
        self.subjects.remove(subject);
    }

    fn sweep(&self) {
        let now = self.clock.monotonic();
        let idle = self.window * IDLE_WINDOWS;
        self.subjects
            .retain(|_, state| now.saturating_sub(state.last_seen) < idle);
    }
}

impl AdjustableLimit for FixedWindowLimiter {
    fn current_limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    fn set_limit(&self, limit: u64) {
        self.limit.store(limit.max(1), Ordering::Relaxed);
    }
}

//─────────────────────────────
//  Sliding window
//─────────────────────────────

#[derive(Debug)]
struct SlidingState {
    times: VecDeque<Duration>,
    last_seen: Duration,
}

/// Bounded queue of admission timestamps within the trailing window.
///
/// More accurate than the fixed window at boundaries. When a burst size is
/// configured, a secondary check rejects once the observed rate over the
/// window reaches `rps` even while the queue is below `limit`.
pub struct SlidingWindowLimiter {
    limit: AtomicU64,
    window: Duration,
    rps: f64,
    burst_check: bool,
    clock: Arc<dyn Clock>,
    subjects: DashMap<String, SlidingState>,
}

impl SlidingWindowLimiter {
    /// Build from config; `limit` and `window` must be positive.
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self, RateLimitError> {
        if config.limit == 0 {
            return Err(RateLimitError::InvalidConfig("limit must be positive".into()));
        }
        if config.window.is_zero() {
            return Err(RateLimitError::InvalidConfig("window must be positive".into()));
        }
        Ok(Self {
            limit: AtomicU64::new(config.limit),
            window: config.window,
            rps: config.rps,
            burst_check: config.burst > 0 && config.rps > 0.0,
            clock,
            subjects: DashMap::new(),
        })
    }

    fn prune(times: &mut VecDeque<Duration>, now: Duration, window: Duration) {
        let horizon = now.saturating_sub(window);
        while matches!(times.front(), Some(&t) if t <= horizon) {
            times.pop_front();
        }
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn allow(&self, subject: &str) -> RateLimitResult {
        let now = self.clock.monotonic();
        let limit = self.limit.load(Ordering::Relaxed);

        let mut state = self
            .subjects
            .entry(subject.to_owned())
            .or_insert_with(|| SlidingState {
                times: VecDeque::new(),
                last_seen: now,
            });
        state.last_seen = now;
        Self::prune(&mut state.times, now, self.window);

        let used = state.times.len() as u64;
        let retry_after = state
            .times
            .front()
            .map(|&oldest| (oldest + self.window).saturating_sub(now))
            .unwrap_or(self.window);

        if used >= limit {
            debug!(subject, limit, "sliding window limit exceeded");
            return RateLimitResult::Exceeded {
                retry_after,
                limit,
                current_usage: used,
            };
        }

        if self.burst_check && (used as f64) >= self.rps {
            let rate = used as f64 / self.window.as_secs_f64();
            if rate >= self.rps {
                debug!(subject, rate, rps = self.rps, "sliding window rate exceeded");
                return RateLimitResult::Exceeded {
                    retry_after,
                    limit,
                    current_usage: used,
                };
            }
        }

        state.times.push_back(now);
        RateLimitResult::Allowed {
            remaining: limit - used - 1,
            reset_after: retry_after,
            limit,
        }
    }

    fn quota(&self, subject: &str) -> Quota {
        let now = self.clock.monotonic();
        let limit = self.limit.load(Ordering::Relaxed);
        let (used, reset_after) = match self.subjects.get_mut(subject) {
            Some(mut state) => {
                Self::prune(&mut state.times, now, self.window);
                let used = state.times.len() as u64;
                let reset = state
                    .times
                    .front()
                    .map(|&oldest| (oldest + self.window).saturating_sub(now))
                    .unwrap_or(Duration::ZERO);
                (used, reset)
            }
            None => (0, Duration::ZERO),
        };
        Quota {
            total: limit,
            remaining: limit.saturating_sub(used),
            reset_after,
            window: WindowUsage {
                start: wall_window_start(&*self.clock, self.window.min(now)),
                duration: self.window,
                used,
            },
        }
    }

    fn reset(&self, subject: &str) {
        self.subjects.remove(subject);
    }

    fn sweep(&self) {
        let now = self.clock.monotonic();
        let idle = self.window * IDLE_WINDOWS;
        self.subjects
            .retain(|_, state| now.saturating_sub(state.last_seen) < idle);
    }
}

impl AdjustableLimit for SlidingWindowLimiter {
    fn current_limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    fn set_limit(&self, limit: u64) {
        self.limit.store(limit.max(1), Ordering::Relaxed);
    }
}

//─────────────────────────────
//  Token bucket
//─────────────────────────────

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_fill: Duration,
    last_seen: Duration,
    used_in_window: u64,
    window_start: Duration,
}

/// Burst-friendly limiter with sustained rate control.
///
/// Tokens refill continuously at `rps` up to a capacity of `burst`;
/// admission requires at least one whole token. Partial tokens are kept as
/// floating point. A non-positive `rps` or zero `burst` always denies.
pub struct TokenBucketLimiter {
    capacity: AtomicU64,
    rps: f64,
    window: Duration,
    clock: Arc<dyn Clock>,
    subjects: DashMap<String, BucketState>,
}

impl TokenBucketLimiter {
    /// Build from config. Invalid parameters are accepted but make every
    /// admission deny, matching the contract for misconfigured buckets.
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: AtomicU64::new(config.burst),
            rps: config.rps,
            window: if config.window.is_zero() {
                Duration::from_secs(1)
            } else {
                config.window
            },
            clock,
            subjects: DashMap::new(),
        }
    }

    fn invalid(&self) -> bool {
        self.rps <= 0.0 || self.capacity.load(Ordering::Relaxed) == 0
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn allow(&self, subject: &str) -> RateLimitResult {
        let now = self.clock.monotonic();
        let capacity = self.capacity.load(Ordering::Relaxed);

        if self.invalid() {
            return RateLimitResult::Exceeded {
                retry_after: self.window,
                limit: capacity,
                current_usage: 0,
            };
        }

        let mut state = self
            .subjects
            .entry(subject.to_owned())
            .or_insert_with(|| BucketState {
                tokens: capacity as f64,
                last_fill: now,
                last_seen: now,
                used_in_window: 0,
                window_start: now,
            });
        state.last_seen = now;

        // Refill from elapsed time, clamped to capacity.
        let elapsed = now.saturating_sub(state.last_fill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rps).min(capacity as f64);
        state.last_fill = now;

        if now.saturating_sub(state.window_start) >= self.window {
            state.used_in_window = 0;
            state.window_start = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            state.used_in_window += 1;
            RateLimitResult::Allowed {
                remaining: state.tokens as u64,
                reset_after: refill_time(capacity as f64 - state.tokens, self.rps),
                limit: capacity,
            }
        } else {
            debug!(subject, tokens = state.tokens, "token bucket empty");
            RateLimitResult::Exceeded {
                retry_after: refill_time(1.0 - state.tokens, self.rps),
                limit: capacity,
                current_usage: state.used_in_window,
            }
        }
    }

    fn quota(&self, subject: &str) -> Quota {
        let now = self.clock.monotonic();
        let capacity = self.capacity.load(Ordering::Relaxed);
        let (remaining, used, elapsed) = match self.subjects.get(subject) {
            Some(state) => {
                let refill = now.saturating_sub(state.last_fill).as_secs_f64() * self.rps;
                let tokens = (state.tokens + refill).min(capacity as f64);
                (
                    tokens as u64,
                    state.used_in_window,
                    now.saturating_sub(state.window_start),
                )
            }
            None => (capacity, 0, Duration::ZERO),
        };
        Quota {
            total: capacity,
            remaining,
            reset_after: refill_time(capacity.saturating_sub(remaining) as f64, self.rps),
            window: WindowUsage {
                start: wall_window_start(&*self.clock, elapsed.min(self.window)),
                duration: self.window,
                used,
            },
        }
    }

    fn reset(&self, subject: &str) {
        self.subjects.remove(subject);
    }

    fn sweep(&self) {
        let now = self.clock.monotonic();
        let idle = self.window * IDLE_WINDOWS;
        self.subjects
            .retain(|_, state| now.saturating_sub(state.last_seen) < idle);
    }
}

impl AdjustableLimit for TokenBucketLimiter {
    fn current_limit(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    fn set_limit(&self, limit: u64) {
        self.capacity.store(limit.max(1), Ordering::Relaxed);
    }
}

fn refill_time(tokens_needed: f64, rps: f64) -> Duration {
    if tokens_needed <= 0.0 || rps <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(tokens_needed / rps)
}
