//! The authorization service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mandate_bus_core::{Event, EventAction, EventBus, EventStatus, EventType};
use mandate_store_core::{StoreError, Token, TokenStore};
use mandate_types::{
    Clock, CustomLookup, Decision, Error, OpContext, Restriction, RestrictionPredicate, Result,
    ScopeSet, Timestamp, TransactionContext, MIN_TOKEN_ENTROPY_BITS,
};

use crate::codec::{Claims, TokenCodec};
use crate::grant::{
    validate_restriction, AuthorizationRequest, Grant, GrantStatus, TokenRequest, TokenResponse,
};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Authorization core parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Maximum grant lifetime.
    #[serde(rename = "grant.ttl")]
    pub grant_ttl: Duration,
    /// Maximum token lifetime.
    #[serde(rename = "token.ttl")]
    pub token_ttl: Duration,
    /// Minimum random entropy per opaque token value, in bits.
    #[serde(rename = "token.length")]
    pub token_entropy_bits: usize,
    /// Scopes the server recognises; `None` accepts any scope string.
    #[serde(default)]
    pub known_scopes: Option<Vec<String>>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            grant_ttl: Duration::from_secs(10 * 60),
            token_ttl: Duration::from_secs(60 * 60),
            token_entropy_bits: MIN_TOKEN_ENTROPY_BITS,
            known_scopes: None,
        }
    }
}

/// Fatal construction-time configuration problems.
///
/// Raised once at startup, never per request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `grant.ttl` must be positive.
    #[error("grant ttl must be positive")]
    InvalidGrantTtl,
    /// `token.ttl` must be positive.
    #[error("token ttl must be positive")]
    InvalidTokenTtl,
    /// `token.length` is below the framework minimum.
    #[error("token entropy {0} below minimum {MIN_TOKEN_ENTROPY_BITS} bits")]
    InsufficientEntropy(usize),
    /// The known-scope list contains an empty string.
    #[error("known scope list contains an empty scope")]
    EmptyScope,
}

impl AuthConfig {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.grant_ttl.is_zero() {
            return Err(ConfigError::InvalidGrantTtl);
        }
        if self.token_ttl.is_zero() {
            return Err(ConfigError::InvalidTokenTtl);
        }
        if self.token_entropy_bits < MIN_TOKEN_ENTROPY_BITS {
            return Err(ConfigError::InsufficientEntropy(self.token_entropy_bits));
        }
        if let Some(scopes) = &self.known_scopes {
            if scopes.iter().any(String::is_empty) {
                return Err(ConfigError::EmptyScope);
            }
        }
        Ok(())
    }
}

//─────────────────────────────
//  The service
//─────────────────────────────

struct Registry(HashMap<String, Arc<dyn RestrictionPredicate>>);

impl CustomLookup for Registry {
    fn lookup(&self, key: &str) -> Option<&dyn RestrictionPredicate> {
        self.0.get(key).map(|p| p.as_ref())
    }
}

/// The authorization core.
///
/// Owns the grant table; tokens are owned by the injected store. All
/// public operations take an [`OpContext`] and honour its deadline and
/// cancellation. Closing the service tears its collaborators down in
/// reverse construction order and drains the event bus within a bounded
/// grace window.
pub struct AuthService {
    config: AuthConfig,
    grants: Mutex<HashMap<Uuid, Grant>>,
    store: Arc<dyn TokenStore>,
    codec: Arc<dyn TokenCodec>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    customs: Registry,
}

impl AuthService {
    /// Construct the service, validating configuration up front.
    pub fn new(
        config: AuthConfig,
        store: Arc<dyn TokenStore>,
        codec: Arc<dyn TokenCodec>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            grants: Mutex::new(HashMap::new()),
            store,
            codec,
            clock,
            bus,
            customs: Registry(HashMap::new()),
        })
    }

    /// Register a predicate for `Custom` restrictions under `key`.
    pub fn with_custom_restriction(
        mut self,
        key: impl Into<String>,
        predicate: Arc<dyn RestrictionPredicate>,
    ) -> Self {
        self.customs.0.insert(key.into(), predicate);
        self
    }

    /// The token store this service issues into.
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Validate an authorization request and issue a grant.
    ///
    /// The grant is created `Pending` and transitions to `Issued`
    /// atomically with its insertion, so callers can only ever observe an
    /// issued grant. Emits `auth.grant.issued`.
    pub async fn initiate_authorization(
        &self,
        ctx: &OpContext,
        req: AuthorizationRequest,
    ) -> Result<Grant> {
        ctx.check()?;
        req.validate()?;
        if let Some(known) = &self.config.known_scopes {
            for scope in req.scopes.iter() {
                if !known.iter().any(|k| k == scope) {
                    return Err(Error::validation("scopes", "unknown_scope"));
                }
            }
        }

        let valid_from = self.clock.timestamp();
        let mut grant = Grant {
            id: Uuid::new_v4(),
            client_id: req.client_id,
            scope: req.scopes,
            restrictions: req.restrictions,
            valid_from,
            valid_until: advance(valid_from, self.config.grant_ttl),
            status: GrantStatus::Pending,
        };
        grant.status = GrantStatus::Issued;
        self.grants.lock().insert(grant.id, grant.clone());

        info!(grant = %grant.id, client = %grant.client_id, "grant issued");
        self.emit(
            Event::new(
                EventType::Auth,
                EventAction::GrantIssued,
                EventStatus::Success,
                self.clock.timestamp(),
            )
            .with_subject(grant.client_id.clone())
            .with_resource(grant.id.to_string())
            .with_meta("scopes", grant.scope.len() as i64),
        )
        .await;

        Ok(grant)
    }

    /// Exchange an issued grant for a bearer token, narrowing only.
    ///
    /// The grant transitions to `Consumed` atomically; a second exchange
    /// of the same grant fails. Emits `token.issued`.
    pub async fn request_token(&self, ctx: &OpContext, req: TokenRequest) -> Result<TokenResponse> {
        ctx.check()?;
        let now = self.clock.monotonic();

        // Snapshot the grant for validation without holding the lock
        // across the codec and store calls.
        let grant = {
            let mut grants = self.grants.lock();
            let grant = grants
                .get_mut(&req.grant_id)
                .ok_or_else(|| Error::not_found("grant"))?;
            if grant.status == GrantStatus::Issued && grant.is_expired(now) {
                grant.status = GrantStatus::Expired;
            }
            match grant.status {
                GrantStatus::Issued => grant.clone(),
                GrantStatus::Pending => return Err(Error::unauthorized("grant_not_issued")),
                GrantStatus::Consumed => return Err(Error::unauthorized("grant_consumed")),
                GrantStatus::Expired => return Err(Error::unauthorized("grant_expired")),
                GrantStatus::Revoked => return Err(Error::unauthorized("grant_revoked")),
            }
        };

        let scope = narrow_scope(&grant, req.scope)?;
        let restrictions = narrow_restrictions(&grant, req.restrictions)?;

        // Consume exactly once; a racing exchange loses here.
        {
            let mut grants = self.grants.lock();
            let entry = grants
                .get_mut(&req.grant_id)
                .ok_or_else(|| Error::not_found("grant"))?;
            if entry.status != GrantStatus::Issued {
                return Err(Error::unauthorized("grant_consumed"));
            }
            if entry.is_expired(self.clock.monotonic()) {
                entry.status = GrantStatus::Expired;
                return Err(Error::unauthorized("grant_expired"));
            }
            entry.status = GrantStatus::Consumed;
        }

        let issued_at = self.clock.timestamp();
        let claims = Claims {
            sub: grant.client_id.clone(),
            scope: scope.clone(),
            restrictions: restrictions.clone(),
            iat: issued_at.wall.timestamp() as u64,
            exp: (issued_at.wall.timestamp() as u64) + self.config.token_ttl.as_secs(),
            jti: grant.id.to_string(),
        };
        let value = self.codec.mint(&claims).await?;

        let token = Token {
            value,
            owner: grant.client_id.clone(),
            scope,
            restrictions,
            issued_at,
            valid_until: advance(issued_at, self.config.token_ttl),
            grant_id: grant.id,
            revoked_at: None,
            revocation_reason: None,
        };
        match self.store.save(token.clone()).await {
            Ok(()) => {}
            // The value space is ≥128 random bits; a collision means the
            // entropy source is broken.
            Err(StoreError::Conflict) => {
                return Err(Error::internal("token value collision"));
            }
            Err(err) => return Err(err.into()),
        }

        debug!(grant = %grant.id, owner = %token.owner, "token issued");
        self.emit(
            Event::new(
                EventType::Token,
                EventAction::TokenIssued,
                EventStatus::Success,
                self.clock.timestamp(),
            )
            .with_subject(token.owner.clone())
            .with_resource(grant.id.to_string()),
        )
        .await;

        Ok(TokenResponse { token })
    }

    /// Validate a presented token value into its claims.
    ///
    /// The store is authoritative: expiry and revocation are decided from
    /// the stored record against the monotonic clock, whatever the value
    /// itself claims.
    pub async fn validate_token(&self, ctx: &OpContext, value: &str) -> Result<Claims> {
        ctx.check()?;
        let token = match self.store.get(value).await {
            Ok(token) => token,
            Err(StoreError::NotFound) => return Err(Error::unauthorized("token_unknown")),
            Err(err) => return Err(err.into()),
        };

        Ok(Claims {
            sub: token.owner,
            scope: token.scope,
            restrictions: token.restrictions,
            iat: token.issued_at.wall.timestamp() as u64,
            exp: token.valid_until.wall.timestamp() as u64,
            jti: token.grant_id.to_string(),
        })
    }

    /// Revoke a token. Emits `token.revoked`.
    pub async fn revoke_token(&self, ctx: &OpContext, value: &str, reason: &str) -> Result<()> {
        ctx.check()?;
        // Best-effort owner lookup for the audit trail; revocation itself
        // does not depend on it.
        let owner = match self.store.get(value).await {
            Ok(token) => token.owner,
            Err(_) => String::new(),
        };
        self.store.revoke(value, reason).await.map_err(Error::from)?;

        info!(owner = %owner, reason, "token revoked");
        self.emit(
            Event::new(
                EventType::Token,
                EventAction::TokenRevoked,
                EventStatus::Success,
                self.clock.timestamp(),
            )
            .with_subject(owner)
            .with_meta("reason", reason),
        )
        .await;
        Ok(())
    }

    /// Evaluate a token's restriction chain against a request context.
    ///
    /// Deterministic and side-effect free; first deny wins.
    pub fn authorize(&self, claims: &Claims, cx: &TransactionContext) -> Decision {
        mandate_types::restriction::evaluate_all(
            &claims.restrictions,
            cx,
            self.clock.wall(),
            &self.customs,
        )
    }

    /// Snapshot of a grant's current state, refreshing lazy expiry.
    pub fn grant(&self, id: Uuid) -> Option<Grant> {
        let now = self.clock.monotonic();
        let mut grants = self.grants.lock();
        let grant = grants.get_mut(&id)?;
        if grant.status == GrantStatus::Issued && grant.is_expired(now) {
            grant.status = GrantStatus::Expired;
        }
        Some(grant.clone())
    }

    /// Revoke an issued grant administratively.
    pub fn revoke_grant(&self, id: Uuid) -> Result<()> {
        let mut grants = self.grants.lock();
        let grant = grants.get_mut(&id).ok_or_else(|| Error::not_found("grant"))?;
        if !grant.status.is_terminal() {
            grant.status = GrantStatus::Revoked;
        }
        Ok(())
    }

    /// Drop grants that reached a terminal state. Advisory.
    pub fn purge_finished_grants(&self) -> usize {
        let now = self.clock.monotonic();
        let mut grants = self.grants.lock();
        let before = grants.len();
        grants.retain(|_, g| {
            if g.status == GrantStatus::Issued && g.is_expired(now) {
                g.status = GrantStatus::Expired;
            }
            !g.status.is_terminal()
        });
        before - grants.len()
    }

    /// Tear the service down: stop accepting work and drain the event bus
    /// within `grace`, force-dropping (counted) whatever remains.
    pub async fn close(&self, grace: Duration) {
        self.bus.close(grace).await;
    }

    async fn emit(&self, event: Event) {
        if let Err(err) = self.bus.publish(event).await {
            warn!(%err, "event publish failed");
        }
    }
}

fn advance(ts: Timestamp, by: Duration) -> Timestamp {
    Timestamp {
        monotonic: ts.monotonic + by,
        wall: ts.wall + chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero()),
    }
}

fn narrow_scope(grant: &Grant, requested: Option<ScopeSet>) -> Result<ScopeSet> {
    match requested {
        None => Ok(grant.scope.clone()),
        Some(scope) => {
            if scope.is_empty() {
                return Err(Error::validation("scope", "empty"));
            }
            scope.validate()?;
            if !scope.is_subset_of(&grant.scope) {
                return Err(Error::validation("scope", "not_subset"));
            }
            Ok(scope)
        }
    }
}

fn narrow_restrictions(
    grant: &Grant,
    requested: Option<Vec<Restriction>>,
) -> Result<Vec<Restriction>> {
    let Some(requested) = requested else {
        return Ok(grant.restrictions.clone());
    };
    for restriction in &requested {
        validate_restriction(restriction)?;
    }
    // Narrowing rights only: every grant restriction must reappear either
    // verbatim or tighter; a comparable-but-looser re-statement is a
    // conflict.
    for granted in &grant.restrictions {
        let mut covered = false;
        for restriction in &requested {
            match restriction.tightens(granted) {
                Some(true) => {
                    covered = true;
                    break;
                }
                Some(false) => {
                    return Err(Error::validation(
                        "restrictions",
                        "scope_restriction_conflict",
                    ));
                }
                None => {}
            }
        }
        if !covered {
            return Err(Error::validation("restrictions", "missing_grant_restriction"));
        }
    }
    Ok(requested)
}
