//! Grants and the request/response surface of the pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mandate_store_core::Token;
use mandate_types::{Error, Restriction, Result, ScopeSet, Timestamp, MAX_CLIENT_ID_LEN, MAX_RESTRICTIONS};

//─────────────────────────────
//  Requests
//─────────────────────────────

/// A client's request to be granted authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    /// The requesting client's identity.
    pub client_id: String,
    /// Requested scopes; at least one.
    pub scopes: ScopeSet,
    /// Requested restrictions; empty means unrestricted within scope.
    #[serde(default)]
    pub restrictions: Vec<Restriction>,
}

impl AuthorizationRequest {
    /// Build a request for `client_id` over `scopes`.
    pub fn new(client_id: impl Into<String>, scopes: ScopeSet) -> Self {
        Self {
            client_id: client_id.into(),
            scopes,
            restrictions: Vec::new(),
        }
    }

    /// Attach a restriction.
    pub fn with_restriction(mut self, restriction: Restriction) -> Self {
        self.restrictions.push(restriction);
        self
    }

    /// Structural validation; scope knowledge is checked by the service.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::validation("client_id", "empty"));
        }
        if self.client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(Error::validation("client_id", "too_long"));
        }
        if self.scopes.is_empty() {
            return Err(Error::validation("scopes", "empty"));
        }
        self.scopes.validate()?;
        if self.restrictions.len() > MAX_RESTRICTIONS {
            return Err(Error::validation("restrictions", "too_many"));
        }
        for restriction in &self.restrictions {
            validate_restriction(restriction)?;
        }
        Ok(())
    }
}

/// Structural well-formedness of one restriction.
pub(crate) fn validate_restriction(restriction: &Restriction) -> Result<()> {
    match restriction {
        Restriction::TimeWindow { from, to } => {
            if from >= to {
                return Err(Error::validation("restrictions", "empty_time_window"));
            }
        }
        Restriction::AmountCap { currency, max } => {
            if currency.is_empty() {
                return Err(Error::validation("restrictions", "missing_currency"));
            }
            if !max.is_finite() || *max < 0.0 {
                return Err(Error::validation("restrictions", "invalid_amount_cap"));
            }
        }
        Restriction::IpRange { cidrs } => {
            if cidrs.is_empty() {
                return Err(Error::validation("restrictions", "empty_ip_range"));
            }
        }
        Restriction::TransactionKinds { kinds } => {
            if kinds.is_empty() || kinds.iter().any(String::is_empty) {
                return Err(Error::validation("restrictions", "empty_kind_set"));
            }
        }
        Restriction::Custom { key, .. } => {
            if key.is_empty() {
                return Err(Error::validation("restrictions", "empty_custom_key"));
            }
        }
    }
    Ok(())
}

/// Exchange request: a grant plus optional narrowing.
///
/// Narrowing only: the scope may shrink and restrictions may tighten or
/// gain members, never the reverse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRequest {
    /// The grant being exchanged.
    pub grant_id: Uuid,
    /// Narrowed scope; `None` keeps the grant's scope.
    #[serde(default)]
    pub scope: Option<ScopeSet>,
    /// Narrowed restrictions; `None` keeps the grant's restrictions.
    #[serde(default)]
    pub restrictions: Option<Vec<Restriction>>,
}

impl TokenRequest {
    /// Exchange `grant_id` without narrowing.
    pub fn new(grant_id: Uuid) -> Self {
        Self {
            grant_id,
            scope: None,
            restrictions: None,
        }
    }

    /// Narrow the scope.
    pub fn with_scope(mut self, scope: ScopeSet) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Narrow the restrictions.
    pub fn with_restrictions(mut self, restrictions: Vec<Restriction>) -> Self {
        self.restrictions = Some(restrictions);
        self
    }
}

/// Successful exchange result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The issued credential record.
    pub token: Token,
}

//─────────────────────────────
//  Grants
//─────────────────────────────

/// Grant lifecycle states.
///
/// ```text
///         issue                consume
/// Pending ────▶ Issued ──────────▶ Consumed
///                 │
///                 ├─ expiry ──▶ Expired
///                 └─ revoke ──▶ Revoked
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    /// Created, not yet returned to the client.
    Pending,
    /// Live and exchangeable.
    Issued,
    /// Exchanged for a token; terminal.
    Consumed,
    /// Lifetime elapsed; terminal.
    Expired,
    /// Administratively revoked; terminal.
    Revoked,
}

impl GrantStatus {
    /// `true` for states a grant can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GrantStatus::Consumed | GrantStatus::Expired | GrantStatus::Revoked
        )
    }
}

/// A short-lived authorization artifact, exchangeable exactly once.
///
/// Owned by the authorization core; the fields copied from the request are
/// immutable after issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    /// Globally unique grant identifier.
    pub id: Uuid,
    /// Client the grant was issued to.
    pub client_id: String,
    /// Granted scope.
    pub scope: ScopeSet,
    /// Granted restrictions.
    pub restrictions: Vec<Restriction>,
    /// Start of validity.
    pub valid_from: Timestamp,
    /// End of validity; the boundary instant counts as expired.
    pub valid_until: Timestamp,
    /// Lifecycle state.
    pub status: GrantStatus,
}

impl Grant {
    /// `true` once the monotonic clock has reached `valid_until`.
    pub fn is_expired(&self, now_monotonic: Duration) -> bool {
        now_monotonic >= self.valid_until.monotonic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mandate_types::MetaValue;

    fn request() -> AuthorizationRequest {
        AuthorizationRequest::new("demo", ScopeSet::new(["tx:exec"]))
    }

    #[test]
    fn valid_request_passes() {
        request().validate().unwrap();
    }

    #[test]
    fn empty_client_and_scopes_are_rejected() {
        let no_client = AuthorizationRequest::new("", ScopeSet::new(["tx:exec"]));
        assert!(matches!(
            no_client.validate(),
            Err(Error::ValidationFailed { field, .. }) if field == "client_id"
        ));

        let no_scopes = AuthorizationRequest::new("demo", ScopeSet::default());
        assert!(matches!(
            no_scopes.validate(),
            Err(Error::ValidationFailed { field, .. }) if field == "scopes"
        ));
    }

    #[test]
    fn malformed_restrictions_are_rejected() {
        let now = chrono::Utc::now();
        let inverted = request().with_restriction(Restriction::TimeWindow {
            from: now,
            to: now - chrono::Duration::seconds(1),
        });
        assert!(inverted.validate().is_err());

        let capless = request().with_restriction(Restriction::AmountCap {
            currency: String::new(),
            max: 10.0,
        });
        assert!(capless.validate().is_err());

        let nan_cap = request().with_restriction(Restriction::AmountCap {
            currency: "USD".into(),
            max: f64::NAN,
        });
        assert!(nan_cap.validate().is_err());

        let no_kinds = request().with_restriction(Restriction::TransactionKinds { kinds: vec![] });
        assert!(no_kinds.validate().is_err());

        let no_key = request().with_restriction(Restriction::Custom {
            key: String::new(),
            value: MetaValue::from(true),
        });
        assert!(no_key.validate().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!GrantStatus::Pending.is_terminal());
        assert!(!GrantStatus::Issued.is_terminal());
        assert!(GrantStatus::Consumed.is_terminal());
        assert!(GrantStatus::Expired.is_terminal());
        assert!(GrantStatus::Revoked.is_terminal());
    }
}
