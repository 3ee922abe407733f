#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mandate-store-memory** – In-memory token store driver for Mandate.
//!
//! The reference [`TokenStore`] implementation. All records live in memory
//! behind a single reader-writer lock; the primary map and both secondary
//! indexes (by owner, by grant) are mutated inside the same critical
//! section so they can never disagree. Suitable for tests, development,
//! and single-process deployments; data is lost when the process exits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use mandate_store_core::{StoreError, Token, TokenStore};
use mandate_types::Clock;

#[derive(Default)]
struct Inner {
    /// Primary index: token value → record.
    tokens: HashMap<String, Token>,
    /// Secondary index: owner → token values.
    by_owner: HashMap<String, HashSet<String>>,
    /// Secondary index: grant → token values.
    by_grant: HashMap<Uuid, HashSet<String>>,
}

impl Inner {
    fn remove(&mut self, value: &str) -> Option<Token> {
        let token = self.tokens.remove(value)?;
        if let Some(values) = self.by_owner.get_mut(&token.owner) {
            values.remove(value);
            if values.is_empty() {
                self.by_owner.remove(&token.owner);
            }
        }
        if let Some(values) = self.by_grant.get_mut(&token.grant_id) {
            values.remove(value);
            if values.is_empty() {
                self.by_grant.remove(&token.grant_id);
            }
        }
        Some(token)
    }

    fn insert(&mut self, token: Token) {
        self.by_owner
            .entry(token.owner.clone())
            .or_default()
            .insert(token.value.clone());
        self.by_grant
            .entry(token.grant_id)
            .or_default()
            .insert(token.value.clone());
        self.tokens.insert(token.value.clone(), token);
    }
}

/// An in-memory, non-persistent token store.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct MemoryTokenStore {
    inner: Arc<RwLock<Inner>>,
    clock: Arc<dyn Clock>,
}

impl MemoryTokenStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            clock,
        }
    }

    /// Number of records currently held, including expired ones not yet
    /// swept.
    pub async fn len(&self) -> usize {
        self.inner.read().await.tokens.len()
    }

    /// `true` when no records are held.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.tokens.is_empty()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save(&self, token: Token) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tokens.contains_key(&token.value) {
            return Err(StoreError::Conflict);
        }
        inner.insert(token);
        Ok(())
    }

    async fn get(&self, value: &str) -> Result<Token, StoreError> {
        let now = self.clock.monotonic();
        {
            let inner = self.inner.read().await;
            match inner.tokens.get(value) {
                None => return Err(StoreError::NotFound),
                Some(token) if token.is_revoked() => {
                    // Revocation outranks expiry: a revoked record is kept
                    // so later reads keep answering Revoked.
                    return Err(StoreError::Revoked {
                        reason: token
                            .revocation_reason
                            .clone()
                            .unwrap_or_else(|| "revoked".into()),
                    });
                }
                Some(token) if !token.is_expired(now) => return Ok(token.clone()),
                Some(_) => {}
            }
        }

        // Expired: upgrade to a write lock and remove lazily. Another
        // writer may have raced us, so re-check under the lock.
        let mut inner = self.inner.write().await;
        match inner.tokens.get(value) {
            None => Err(StoreError::NotFound),
            Some(token) if token.is_revoked() => Err(StoreError::Revoked {
                reason: token
                    .revocation_reason
                    .clone()
                    .unwrap_or_else(|| "revoked".into()),
            }),
            Some(token) if token.is_expired(now) => {
                inner.remove(value);
                debug!(token = value, "removed expired token on read");
                Err(StoreError::Expired)
            }
            Some(token) => Ok(token.clone()),
        }
    }

    async fn revoke(&self, value: &str, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.tokens.get_mut(value) {
            None => Err(StoreError::NotFound),
            Some(token) => {
                if token.revoked_at.is_none() {
                    token.revoked_at = Some(self.clock.timestamp());
                    token.revocation_reason = Some(reason.to_owned());
                    debug!(token = value, reason, "token revoked");
                }
                Ok(())
            }
        }
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Token>, StoreError> {
        let now = self.clock.monotonic();
        let inner = self.inner.read().await;
        let Some(values) = inner.by_owner.get(owner) else {
            return Ok(Vec::new());
        };
        Ok(values
            .iter()
            .filter_map(|v| inner.tokens.get(v))
            .filter(|t| !t.is_revoked() && !t.is_expired(now))
            .cloned()
            .collect())
    }

    async fn list_by_grant(&self, grant_id: Uuid) -> Result<Vec<Token>, StoreError> {
        let now = self.clock.monotonic();
        let inner = self.inner.read().await;
        let Some(values) = inner.by_grant.get(&grant_id) else {
            return Ok(Vec::new());
        };
        Ok(values
            .iter()
            .filter_map(|v| inner.tokens.get(v))
            .filter(|t| !t.is_revoked() && !t.is_expired(now))
            .cloned()
            .collect())
    }

    async fn cleanup(&self) -> Result<usize, StoreError> {
        let now = self.clock.monotonic();
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .tokens
            .values()
            .filter(|t| t.is_expired(now) && !t.is_revoked())
            .map(|t| t.value.clone())
            .collect();
        for value in &expired {
            inner.remove(value);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "cleanup removed expired tokens");
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mandate_types::{ManualClock, ScopeSet, Timestamp};
    use std::time::Duration;

    fn store_with_clock() -> (MemoryTokenStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (MemoryTokenStore::new(clock.clone()), clock)
    }

    fn token(clock: &ManualClock, value: &str, owner: &str, ttl_secs: u64) -> Token {
        let issued_at = clock.timestamp();
        let ttl = Duration::from_secs(ttl_secs);
        Token {
            value: value.into(),
            owner: owner.into(),
            scope: ScopeSet::new(["tx:exec"]),
            restrictions: vec![],
            issued_at,
            valid_until: Timestamp {
                monotonic: issued_at.monotonic + ttl,
                wall: issued_at.wall + chrono::Duration::from_std(ttl).unwrap(),
            },
            grant_id: Uuid::new_v4(),
            revoked_at: None,
            revocation_reason: None,
        }
    }

    #[tokio::test]
    async fn save_then_get_roundtrips() {
        let (store, clock) = store_with_clock();
        let t = token(&clock, "tok-1", "alice", 60);
        store.save(t.clone()).await.unwrap();
        assert_eq!(store.get("tok-1").await.unwrap(), t);
    }

    #[tokio::test]
    async fn duplicate_save_conflicts_without_overwrite() {
        let (store, clock) = store_with_clock();
        let original = token(&clock, "tok-1", "alice", 60);
        store.save(original.clone()).await.unwrap();

        let intruder = token(&clock, "tok-1", "mallory", 60);
        assert_eq!(store.save(intruder).await, Err(StoreError::Conflict));

        let kept = store.get("tok-1").await.unwrap();
        assert_eq!(kept.owner, "alice");
    }

    #[tokio::test]
    async fn expired_token_is_lazily_removed() {
        let (store, clock) = store_with_clock();
        store.save(token(&clock, "tok-1", "alice", 60)).await.unwrap();

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.get("tok-1").await, Err(StoreError::Expired));
        // Lazy removal happened: a second read no longer finds the record.
        assert_eq!(store.get("tok-1").await, Err(StoreError::NotFound));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn revocation_is_idempotent_and_monotonic() {
        let (store, clock) = store_with_clock();
        store.save(token(&clock, "tok-1", "alice", 3600)).await.unwrap();

        store.revoke("tok-1", "abuse").await.unwrap();
        let first = match store.get("tok-1").await {
            Err(StoreError::Revoked { reason }) => reason,
            other => panic!("expected revoked, got {other:?}"),
        };
        assert_eq!(first, "abuse");

        // A second revoke keeps the original reason.
        store.revoke("tok-1", "second-reason").await.unwrap();
        match store.get("tok-1").await {
            Err(StoreError::Revoked { reason }) => assert_eq!(reason, "abuse"),
            other => panic!("expected revoked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn revoke_missing_token_is_not_found() {
        let (store, _clock) = store_with_clock();
        assert_eq!(store.revoke("nope", "r").await, Err(StoreError::NotFound));
    }

    #[tokio::test]
    async fn list_by_owner_excludes_revoked_and_expired() {
        let (store, clock) = store_with_clock();
        store.save(token(&clock, "live", "alice", 3600)).await.unwrap();
        store.save(token(&clock, "dead", "alice", 30)).await.unwrap();
        store.save(token(&clock, "gone", "alice", 3600)).await.unwrap();
        store.save(token(&clock, "other", "bob", 3600)).await.unwrap();

        store.revoke("gone", "abuse").await.unwrap();
        clock.advance(Duration::from_secs(31));

        let listed = store.list_by_owner("alice").await.unwrap();
        let values: Vec<&str> = listed.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(values, vec!["live"]);
    }

    #[tokio::test]
    async fn list_by_grant_tracks_exchanged_tokens() {
        let (store, clock) = store_with_clock();
        let mut t1 = token(&clock, "a", "alice", 3600);
        let mut t2 = token(&clock, "b", "alice", 3600);
        let grant = Uuid::new_v4();
        t1.grant_id = grant;
        t2.grant_id = grant;
        store.save(t1).await.unwrap();
        store.save(t2).await.unwrap();
        store.save(token(&clock, "c", "alice", 3600)).await.unwrap();

        let listed = store.list_by_grant(grant).await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_sweeps_only_expired_unrevoked_records() {
        let (store, clock) = store_with_clock();
        store.save(token(&clock, "live", "alice", 3600)).await.unwrap();
        store.save(token(&clock, "dead", "alice", 30)).await.unwrap();
        store.save(token(&clock, "revoked", "alice", 30)).await.unwrap();
        store.revoke("revoked", "abuse").await.unwrap();

        clock.advance(Duration::from_secs(60));
        let removed = store.cleanup().await.unwrap();
        assert_eq!(removed, 1);
        // The revoked record outlives its expiry so revocation stays
        // observable.
        assert!(matches!(
            store.get("revoked").await,
            Err(StoreError::Revoked { .. })
        ));
        assert_eq!(store.get("live").await.unwrap().value, "live");
    }
}
