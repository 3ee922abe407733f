//! Three-state circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mandate_types::{Clock, Error, Result};

/// Circuit breaker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` that trip the circuit (N).
    pub failure_threshold: u32,
    /// Consecutive probe successes in `HalfOpen` that close it (M).
    pub success_threshold: u32,
    /// How long the circuit stays `Open` before probing (D).
    pub open_duration: Duration,
    /// Max concurrent probes admitted in `HalfOpen` (K).
    pub probe_concurrency: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            probe_concurrency: 1,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow; consecutive failures are counted.
    Closed,
    /// Calls fail fast until the open duration elapses.
    Open,
    /// A bounded number of probes test whether the resource recovered.
    HalfOpen,
}

/// Cheap observability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed in `Closed`.
    pub failures: u32,
    /// Consecutive successes observed in `HalfOpen`.
    pub successes: u32,
    /// Times the circuit has tripped `Closed`→`Open`.
    pub trips: u64,
}

struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    probes: u32,
    opened_at: Duration,
    trips: u64,
}

/// Three-state failure isolation for one protected resource.
///
/// All transitions happen inside one short critical section, so concurrent
/// callers observe them atomically. Cancellation bypasses the state
/// machine entirely: a cancelled call is neither a success nor a failure.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker in `Closed` reading time from `clock`.
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                probes: 0,
                opened_at: Duration::ZERO,
                trips: 0,
            }),
        }
    }

    /// Ask to run one call.
    ///
    /// Returns a [`CallGuard`] that must be completed with
    /// [`CallGuard::success`], [`CallGuard::failure`] or
    /// [`CallGuard::cancelled`]; dropping it uncompleted counts as
    /// cancelled. Fails fast with [`Error::CircuitOpen`] while the circuit
    /// is open or probe capacity is exhausted.
    pub fn try_acquire(&self) -> Result<CallGuard<'_>> {
        let now = self.clock.monotonic();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallGuard::new(self, false)),
            CircuitState::Open => {
                if now.saturating_sub(inner.opened_at) >= self.config.open_duration {
                    debug!("open duration elapsed, probing half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.probes = 1;
                    Ok(CallGuard::new(self, true))
                } else {
                    Err(Error::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes < self.config.probe_concurrency {
                    inner.probes += 1;
                    Ok(CallGuard::new(self, true))
                } else {
                    Err(Error::CircuitOpen)
                }
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Observability snapshot.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            trips: inner.trips,
        }
    }

    fn complete(&self, probe: bool, outcome: Outcome) {
        let mut inner = self.inner.lock();
        if probe && inner.probes > 0 {
            inner.probes -= 1;
        }
        match outcome {
            Outcome::Cancelled => {}
            Outcome::Success => match inner.state {
                CircuitState::Closed => inner.failures = 0,
                CircuitState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= self.config.success_threshold {
                        debug!("probe successes reached threshold, closing circuit");
                        inner.state = CircuitState::Closed;
                        inner.failures = 0;
                        inner.successes = 0;
                        inner.probes = 0;
                    }
                }
                // A stale probe completing after a re-open changes nothing.
                CircuitState::Open => {}
            },
            Outcome::Failure => match inner.state {
                CircuitState::Closed => {
                    inner.failures += 1;
                    if inner.failures >= self.config.failure_threshold {
                        warn!(failures = inner.failures, "failure threshold reached, opening circuit");
                        inner.state = CircuitState::Open;
                        inner.opened_at = self.clock.monotonic();
                        inner.trips += 1;
                        inner.successes = 0;
                        inner.probes = 0;
                    }
                }
                CircuitState::HalfOpen => {
                    warn!("probe failed, reopening circuit");
                    inner.state = CircuitState::Open;
                    inner.opened_at = self.clock.monotonic();
                    inner.trips += 1;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.probes = 0;
                }
                CircuitState::Open => {}
            },
        }
    }
}

enum Outcome {
    Success,
    Failure,
    Cancelled,
}

/// In-flight call accounting handle.
///
/// Exactly one of the completion methods should be called; dropping the
/// guard without completing it releases the probe slot without touching
/// the counters (the cancellation semantics).
pub struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    done: bool,
}

impl<'a> CallGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            done: false,
        }
    }

    /// Record a successful call.
    pub fn success(mut self) {
        self.done = true;
        self.breaker.complete(self.probe, Outcome::Success);
    }

    /// Record a failed call.
    pub fn failure(mut self) {
        self.done = true;
        self.breaker.complete(self.probe, Outcome::Failure);
    }

    /// Release without recording; cancellation is not a failure.
    pub fn cancelled(mut self) {
        self.done = true;
        self.breaker.complete(self.probe, Outcome::Cancelled);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.complete(self.probe, Outcome::Cancelled);
        }
    }
}
