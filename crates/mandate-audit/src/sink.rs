//! The sink contract, record integrity tags, and the in-memory sink.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use mandate_bus_core::Event;

use crate::canonical::canonical_bytes;

type HmacSha256 = Hmac<Sha256>;

/// Length of a record integrity tag in bytes.
pub const TAG_LEN: usize = 32;

/// Compute the integrity tag for record `seq` with canonical `bytes`.
///
/// The sequence number is folded into the tag so records cannot be
/// reordered or replayed at a different position without detection.
pub fn integrity_tag(key: &[u8], seq: u64, bytes: &[u8]) -> [u8; TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&seq.to_be_bytes());
    mac.update(bytes);
    mac.finalize().into_bytes().into()
}

/// Constant-time verification of a record's integrity tag.
pub fn verify_tag(key: &[u8], seq: u64, bytes: &[u8], tag: &[u8]) -> bool {
    if tag.len() != TAG_LEN {
        return false;
    }
    let expected = integrity_tag(key, seq, bytes);
    expected.ct_eq(tag).into()
}

/// Sink failure modes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Transient I/O problem; the record may be retried.
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
    /// Integrity or path-safety violation; not retryable.
    #[error("audit sink fatal: {0}")]
    Fatal(String),
}

/// Durable append target for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one event, returning the sequence number it was recorded
    /// under. Sequence numbers strictly increase per sink.
    async fn append(&self, event: &Event) -> Result<u64, SinkError>;
}

//─────────────────────────────
//  In-memory sink
//─────────────────────────────

/// One stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRecord {
    /// Sequence number.
    pub seq: u64,
    /// Canonical event bytes.
    pub bytes: Vec<u8>,
    /// Integrity tag over `seq ‖ bytes`.
    pub tag: [u8; TAG_LEN],
}

struct MemoryState {
    records: Vec<MemoryRecord>,
    next_seq: u64,
    fail_next: u32,
}

/// Non-persistent sink with the same record shape as the file sink.
///
/// Appends can be made to fail on demand, which the service tests use to
/// exercise requeue and unhealthy escalation.
pub struct MemoryAuditSink {
    key: Vec<u8>,
    state: Mutex<MemoryState>,
}

impl MemoryAuditSink {
    /// Create a sink tagging records with `key`.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(MemoryState {
                records: Vec::new(),
                next_seq: 0,
                fail_next: 0,
            }),
        }
    }

    /// Make the next `n` appends fail with [`SinkError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Snapshot of all records.
    pub fn records(&self) -> Vec<MemoryRecord> {
        self.state.lock().records.clone()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// `true` when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verify every stored record's tag.
    pub fn verify_all(&self) -> bool {
        let state = self.state.lock();
        state
            .records
            .iter()
            .all(|r| verify_tag(&self.key, r.seq, &r.bytes, &r.tag))
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: &Event) -> Result<u64, SinkError> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SinkError::Unavailable("injected failure".into()));
        }
        let seq = state.next_seq;
        let bytes = canonical_bytes(event);
        let tag = integrity_tag(&self.key, seq, &bytes);
        state.records.push(MemoryRecord { seq, bytes, tag });
        state.next_seq += 1;
        Ok(seq)
    }
}
