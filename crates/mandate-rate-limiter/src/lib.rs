#![forbid(unsafe_code)]

//! **mandate-rate-limiter** – Per-subject admission control for Mandate.
//!
//! Three interchangeable algorithms behind one interface:
//!
//! * **Fixed window**: simple counter reset at window boundaries
//! * **Sliding window**: bounded timestamp queue, accurate at boundaries
//! * **Token bucket**: burst-friendly with sustained rate control
//!
//! plus an **adaptive wrapper** that retunes any of them from observed
//! usage. Subjects (the `owner` of a token, an IP, an endpoint key) hold
//! independent state in a concurrent map with lazy eviction on access and
//! a periodic [`RateLimiter::sweep`]; a cold subject costs no memory.
//!
//! Time is read once per admission decision from the injected monotonic
//! [`Clock`](mandate_types::Clock), so wall-clock drift can never move a
//! window backwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod adaptive;
pub mod algorithms;
pub mod middleware;

pub use adaptive::{AdaptiveConfig, AdaptiveLimiter};
pub use algorithms::{FixedWindowLimiter, SlidingWindowLimiter, TokenBucketLimiter};
pub use middleware::{ClientIdKey, KeyExtractor, RateLimitHeaders, RemoteIpKey, RequestInfo};

//─────────────────────────────
//  Results & quotas
//─────────────────────────────

/// Outcome of one admission decision.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    /// The request is admitted.
    Allowed {
        /// Remaining capacity in the current window.
        remaining: u64,
        /// Time until the window (or bucket) fully resets.
        reset_after: Duration,
        /// Limit currently being enforced.
        limit: u64,
    },
    /// The request is rejected.
    Exceeded {
        /// How long to wait before the next admission can succeed.
        retry_after: Duration,
        /// Limit currently being enforced.
        limit: u64,
        /// Usage observed in the current window.
        current_usage: u64,
    },
}

impl RateLimitResult {
    /// `true` when the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }

    /// Retry hint when rejected.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitResult::Exceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Remaining capacity when admitted.
    pub fn remaining(&self) -> Option<u64> {
        match self {
            RateLimitResult::Allowed { remaining, .. } => Some(*remaining),
            _ => None,
        }
    }

    /// Map a rejection onto the framework error taxonomy.
    pub fn to_error(&self) -> Option<mandate_types::Error> {
        match self {
            RateLimitResult::Exceeded { retry_after, .. } => {
                Some(mandate_types::Error::RateLimited {
                    retry_after: *retry_after,
                })
            }
            _ => None,
        }
    }
}

/// Usage snapshot of one subject's current window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowUsage {
    /// Wall-clock start of the window.
    pub start: chrono::DateTime<chrono::Utc>,
    /// Window length.
    pub duration: Duration,
    /// Requests admitted so far in this window.
    pub used: u64,
}

/// Full quota view for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    /// Limit currently being enforced.
    pub total: u64,
    /// Remaining capacity.
    pub remaining: u64,
    /// Time until the quota fully resets.
    pub reset_after: Duration,
    /// Current window detail.
    pub window: WindowUsage,
}

//─────────────────────────────
//  Errors & configuration
//─────────────────────────────

/// Rate limiter construction errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    /// The configuration cannot describe a working limiter.
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfig(String),
}

/// Selectable algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Fixed window counter.
    Fixed,
    /// Sliding window timestamp queue.
    Sliding,
    /// Token bucket.
    TokenBucket,
}

/// Shared algorithm parameters.
///
/// `limit`/`window` drive the window algorithms; `rps`/`burst` drive the
/// token bucket (and the sliding window's burst check).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Which algorithm to run.
    pub algorithm: Algorithm,
    /// Max admissions per window (fixed/sliding).
    pub limit: u64,
    /// Window length.
    pub window: Duration,
    /// Sustained refill rate in requests per second (bucket, sliding burst
    /// check).
    pub rps: f64,
    /// Burst capacity (bucket capacity; sliding burst check trigger).
    pub burst: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::TokenBucket,
            limit: 100,
            window: Duration::from_secs(60),
            rps: 10.0,
            burst: 20,
        }
    }
}

//─────────────────────────────
//  The limiter interface
//─────────────────────────────

/// Per-subject admission control.
///
/// All methods are safe under concurrent callers; `now` is read exactly
/// once per [`RateLimiter::allow`] call.
pub trait RateLimiter: Send + Sync {
    /// Decide admission for one request by `subject`.
    fn allow(&self, subject: &str) -> RateLimitResult;

    /// Current quota snapshot for `subject` without consuming capacity.
    fn quota(&self, subject: &str) -> Quota;

    /// Forget `subject`'s state (admin operation).
    fn reset(&self, subject: &str);

    /// Evict subjects idle for at least twice the window. Call
    /// periodically; safe to skip.
    fn sweep(&self);
}

/// Limiters whose enforced limit can be retuned at runtime.
///
/// Implemented by all bundled algorithms so [`AdaptiveLimiter`] can wrap
/// any of them.
pub trait AdjustableLimit {
    /// Limit currently being enforced.
    fn current_limit(&self) -> u64;

    /// Replace the enforced limit; takes effect on the next admission.
    fn set_limit(&self, limit: u64);
}

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use super::{
        AdaptiveConfig, AdaptiveLimiter, AdjustableLimit, Algorithm, FixedWindowLimiter, Quota,
        RateLimitConfig, RateLimitError, RateLimitResult, RateLimiter, SlidingWindowLimiter,
        TokenBucketLimiter,
    };
}
