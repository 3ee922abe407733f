#![forbid(unsafe_code)]

//! **mandate-resilience** – Failure isolation primitives for Mandate.
//!
//! Four small building blocks and their contractual composition:
//!
//! * [`CircuitBreaker`]: three-state failure isolation per protected
//!   resource
//! * [`with_retry`]: exponential-backoff reattempts honouring cancellation
//! * [`Bulkhead`]: bounded-concurrency semaphore
//! * [`Composite`]: rate-limit → bulkhead → breaker → retry around one
//!   guarded call
//!
//! The composition order is a contract, not a convenience: admission
//! control is cheapest and runs first, an open circuit short-circuits
//! before any work is attempted, and every retry attempt runs under the
//! breaker so repeated failures flip it open.

mod bulkhead;
mod circuit_breaker;
mod composite;
mod retry;

pub use bulkhead::{Bulkhead, BulkheadConfig};
pub use circuit_breaker::{BreakerConfig, BreakerStats, CallGuard, CircuitBreaker, CircuitState};
pub use composite::{Composite, ResilienceConfig};
pub use retry::{with_retry, RetryConfig};

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use super::{
        with_retry, BreakerConfig, Bulkhead, BulkheadConfig, CircuitBreaker, CircuitState,
        Composite, ResilienceConfig, RetryConfig,
    };
}
