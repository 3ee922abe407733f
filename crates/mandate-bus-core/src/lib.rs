#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mandate-bus-core** – Typed event bus for Mandate.
//!
//! This crate provides the canonical event model and an in-process
//! publish/subscribe bus. Every state change in the framework flows through
//! here: grant issuance, token issuance and revocation, processed
//! transactions, and the sentinel events the bus itself emits when it has
//! to degrade (dropped events, failed handlers).
//!
//! Each subscriber owns a bounded queue drained by a dedicated worker task,
//! which gives two guarantees the rest of the system leans on: events are
//! observed in publish order per subscriber, and one subscriber's slow or
//! failing handler can never affect another's delivery.

mod bus;
mod event;

pub use bus::{
    handler_fn, BusConfig, BusError, BusStats, EventBus, EventHandler, OverflowPolicy,
    SubscriptionId,
};
pub use event::{Event, EventAction, EventFilter, EventStatus, EventType};

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        BusConfig, Event, EventAction, EventBus, EventFilter, EventHandler, EventStatus,
        EventType, OverflowPolicy, SubscriptionId,
    };
}
