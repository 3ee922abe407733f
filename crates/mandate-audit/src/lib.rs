#![forbid(unsafe_code)]

//! **mandate-audit** – Durable audit trail for Mandate.
//!
//! Events are serialized to a stable canonical byte form (fixed field
//! order, tag-prefixed typed values) and appended to a sink with a keyed
//! integrity tag per record: `HMAC-SHA256(key, seq ‖ canonical_bytes)`
//! under a strictly increasing per-sink sequence number. The bundled
//! [`FileAuditSink`] writes length-prefixed records into append-only
//! segment files with atomic rotation and truncation recovery;
//! [`MemoryAuditSink`] keeps the same record shape in memory for tests.
//! [`AuditService`] bridges the event bus into a sink with failure
//! counting, requeue, and an unhealthy sentinel past a threshold.

pub mod canonical;
pub mod file;
pub mod service;
pub mod sink;

pub use canonical::canonical_bytes;
pub use file::{AuditConfig, FileAuditSink};
pub use service::AuditService;
pub use sink::{integrity_tag, verify_tag, AuditSink, MemoryAuditSink, SinkError, TAG_LEN};

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        canonical_bytes, AuditConfig, AuditService, AuditSink, FileAuditSink, MemoryAuditSink,
        SinkError,
    };
}
