//! Clock abstraction.
//!
//! All lifetime comparisons inside the framework use a *monotonic* reading
//! (a `Duration` offset from the clock's origin) so wall-clock drift can
//! never move a window backwards; the wall-clock reading is attached to
//! events for audit purposes only. Production code uses [`SystemClock`],
//! tests drive [`ManualClock`] by hand.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A dual monotonic + wall-clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Monotonic offset from the clock's origin.
    pub monotonic: Duration,
    /// Wall-clock time at the same instant.
    pub wall: DateTime<Utc>,
}

/// Injectable time source.
pub trait Clock: Send + Sync {
    /// Monotonic reading as an offset from the clock's origin.
    ///
    /// Successive calls never decrease.
    fn monotonic(&self) -> Duration;

    /// Current wall-clock time.
    fn wall(&self) -> DateTime<Utc>;

    /// Both readings taken together.
    fn timestamp(&self) -> Timestamp {
        Timestamp {
            monotonic: self.monotonic(),
            wall: self.wall(),
        }
    }
}

/// Process clock backed by [`Instant`] and [`Utc::now`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose monotonic origin is the moment of construction.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for deterministic tests.
///
/// Starts at monotonic zero and a fixed wall origin; [`ManualClock::advance`]
/// moves both readings forward together.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    monotonic: Duration,
    wall: DateTime<Utc>,
}

impl ManualClock {
    /// Create a manual clock starting at the given wall time.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                monotonic: Duration::ZERO,
                wall,
            }),
        }
    }

    /// Create a manual clock starting at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Advance both readings by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut state = self.state.lock();
        state.monotonic += delta;
        state.wall += chrono::Duration::from_std(delta).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.state.lock().monotonic
    }

    fn wall(&self) -> DateTime<Utc> {
        self.state.lock().wall
    }
}
