#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mandate-store-core** – Core token storage abstraction for Mandate.
//!
//! This crate defines the credential record ([`Token`]) and the pluggable
//! [`TokenStore`] contract without providing concrete drivers. The
//! in-memory reference driver lives in `mandate-store-memory`; Redis/SQL
//! adapters implement the same trait in their own crates, provided they
//! preserve the contract's serializability guarantees for revocation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mandate_types::{Error, Restriction, ScopeSet, Timestamp};

//─────────────────────────────
//  The credential record
//─────────────────────────────

/// A stored bearer credential.
///
/// The token store exclusively owns records of this type. The `grant_id`
/// back-reference is weak: tokens survive consumption of the grant they
/// were exchanged for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Opaque high-entropy credential value; the primary key.
    pub value: String,
    /// Subject identity the credential acts for; rate-limit bucket key.
    pub owner: String,
    /// Final effective scope set.
    pub scope: ScopeSet,
    /// Final effective restrictions.
    pub restrictions: Vec<Restriction>,
    /// Issue instant.
    pub issued_at: Timestamp,
    /// Expiry instant; the token is invalid from this instant onward.
    pub valid_until: Timestamp,
    /// Grant this token was exchanged from.
    pub grant_id: Uuid,
    /// Set once on revocation, never cleared.
    pub revoked_at: Option<Timestamp>,
    /// Operator-supplied revocation reason.
    pub revocation_reason: Option<String>,
}

impl Token {
    /// `true` once the monotonic clock has reached `valid_until`.
    ///
    /// The boundary instant itself counts as expired.
    pub fn is_expired(&self, now_monotonic: Duration) -> bool {
        now_monotonic >= self.valid_until.monotonic
    }

    /// `true` once the token has been revoked. Monotonic: never un-set.
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Outcomes of store operations that are part of the contract.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// A record with the same value already exists; nothing was written.
    #[error("token value already stored")]
    Conflict,
    /// No record under the given value.
    #[error("token not found")]
    NotFound,
    /// The record exists but its lifetime has elapsed.
    #[error("token expired")]
    Expired,
    /// The record exists but has been revoked.
    #[error("token revoked: {reason}")]
    Revoked {
        /// Reason recorded at revocation time.
        reason: String,
    },
    /// Transient storage failure; safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Integrity failure reading a record back; fatal.
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => Error::conflict("token value"),
            StoreError::NotFound => Error::not_found("token"),
            StoreError::Expired => Error::unauthorized("token_expired"),
            StoreError::Revoked { .. } => Error::unauthorized("token_revoked"),
            StoreError::Unavailable(reason) => Error::unavailable(reason),
            StoreError::Corrupt(reason) => Error::internal(format!("store corrupt: {reason}")),
        }
    }
}

//─────────────────────────────
//  The store contract
//─────────────────────────────

/// Pluggable credential repository.
///
/// Every method is safe under concurrent callers. Revocation is
/// linearizable: once `revoke` returns, no later `get` observes the token
/// as valid. Implementations surface transient I/O problems as
/// [`StoreError::Unavailable`] (retryable) and integrity failures as
/// [`StoreError::Corrupt`] (fatal).
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a token. At-most-once per value: a duplicate returns
    /// [`StoreError::Conflict`] and does not overwrite.
    async fn save(&self, token: Token) -> Result<(), StoreError>;

    /// Look up a token by value.
    ///
    /// An expired record is removed lazily and reported as
    /// [`StoreError::Expired`]; a revoked record as
    /// [`StoreError::Revoked`].
    async fn get(&self, value: &str) -> Result<Token, StoreError>;

    /// Revoke a token, recording `reason`. Idempotent; an already-revoked
    /// token keeps its original revocation instant and reason.
    async fn revoke(&self, value: &str, reason: &str) -> Result<(), StoreError>;

    /// Snapshot of the owner's live (unexpired, unrevoked) tokens.
    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Token>, StoreError>;

    /// Snapshot of the live tokens exchanged from a grant.
    async fn list_by_grant(&self, grant_id: Uuid) -> Result<Vec<Token>, StoreError>;

    /// Advisory sweep removing expired records. Returns how many were
    /// removed. Safe to skip entirely.
    async fn cleanup(&self) -> Result<usize, StoreError>;
}

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{StoreError, Token, TokenStore};
}

#[cfg(test)]
mod tests {
    use super::*;
    use mandate_types::{Clock, ManualClock};

    fn sample_token(clock: &ManualClock, ttl: Duration) -> Token {
        let issued_at = clock.timestamp();
        let valid_until = Timestamp {
            monotonic: issued_at.monotonic + ttl,
            wall: issued_at.wall + chrono::Duration::from_std(ttl).unwrap(),
        };
        Token {
            value: "tok".into(),
            owner: "alice".into(),
            scope: ScopeSet::new(["tx:exec"]),
            restrictions: vec![],
            issued_at,
            valid_until,
            grant_id: Uuid::new_v4(),
            revoked_at: None,
            revocation_reason: None,
        }
    }

    #[test]
    fn expiry_boundary_is_expired() {
        let clock = ManualClock::new();
        let token = sample_token(&clock, Duration::from_secs(60));
        assert!(!token.is_expired(Duration::from_secs(59)));
        assert!(token.is_expired(Duration::from_secs(60)));
        assert!(token.is_expired(Duration::from_secs(61)));
    }

    #[test]
    fn store_errors_map_onto_the_taxonomy() {
        assert_eq!(Error::from(StoreError::Conflict).wire_code(), "conflict");
        assert_eq!(Error::from(StoreError::NotFound).wire_code(), "not_found");
        assert_eq!(Error::from(StoreError::Expired).wire_code(), "unauthorized");
        assert_eq!(
            Error::from(StoreError::Revoked { reason: "abuse".into() }).wire_code(),
            "unauthorized"
        );
        assert_eq!(
            Error::from(StoreError::Unavailable("io".into())).wire_code(),
            "unavailable"
        );
        assert_eq!(
            Error::from(StoreError::Corrupt("bad tag".into())).wire_code(),
            "internal"
        );
    }

    #[test]
    fn token_roundtrips_through_json() {
        let clock = ManualClock::new();
        let token = sample_token(&clock, Duration::from_secs(60));
        let json = serde_json::to_string(&token).unwrap();
        let back: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(token, back);
    }
}
