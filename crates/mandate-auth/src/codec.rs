//! Token codecs.
//!
//! The core never assumes what a token value *is*; it mints and parses
//! through the [`TokenCodec`] trait. [`JwtHs256Codec`] produces
//! self-describing signed JWTs that round-trip their claims;
//! [`OpaqueCodec`] produces pure random values and refuses to parse - the
//! token store is the only source of truth for opaque claims.

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mandate_types::{Error, RandomSource, Restriction, Result, ScopeSet, MIN_TOKEN_ENTROPY_BITS};

/// JWT `typ` header marking Mandate capability tokens.
const JWT_TYP: &str = "mandate+jwt";

/// Canonical claim set carried by every token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the owner identity the token acts for.
    pub sub: String,
    /// Effective scope set.
    pub scope: ScopeSet,
    /// Effective restrictions.
    #[serde(default)]
    pub restrictions: Vec<Restriction>,
    /// Issued-at (seconds since Unix epoch).
    pub iat: u64,
    /// Expiry (seconds since Unix epoch).
    pub exp: u64,
    /// Unique token identifier for replay protection and audit.
    pub jti: String,
}

impl Claims {
    /// Construct claims valid from `iat` for `ttl_secs`, with a fresh id.
    pub fn new(sub: impl Into<String>, scope: ScopeSet, iat: u64, ttl_secs: u64) -> Self {
        Self {
            sub: sub.into(),
            scope,
            restrictions: Vec::new(),
            iat,
            exp: iat + ttl_secs,
            jti: Uuid::new_v4().to_string(),
        }
    }

    /// Attach restrictions.
    pub fn with_restrictions(mut self, restrictions: Vec<Restriction>) -> Self {
        self.restrictions = restrictions;
        self
    }
}

/// Mints and parses opaque token values.
#[async_trait]
pub trait TokenCodec: Send + Sync {
    /// Produce the wire value for `claims`.
    async fn mint(&self, claims: &Claims) -> Result<String>;

    /// Recover the claims embedded in `raw`, verifying authenticity and
    /// expiry. Codecs whose values carry no claims return
    /// `Unauthorized(opaque_token)`.
    async fn parse(&self, raw: &str) -> Result<Claims>;
}

//─────────────────────────────
//  HS256 JWT codec
//─────────────────────────────

/// Self-describing HS256 JWT codec.
#[derive(Clone)]
pub struct JwtHs256Codec {
    secret: String,
    validation: Validation,
}

impl JwtHs256Codec {
    /// Create a codec signing and verifying with `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            secret: secret.into(),
            validation,
        }
    }
}

#[async_trait]
impl TokenCodec for JwtHs256Codec {
    async fn mint(&self, claims: &Claims) -> Result<String> {
        let mut header = Header::new(Algorithm::HS256);
        header.typ = Some(JWT_TYP.into());
        encode(
            &header,
            claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| Error::internal(format!("jwt encode: {e}")))
    }

    async fn parse(&self, raw: &str) -> Result<Claims> {
        decode::<Claims>(
            raw,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &self.validation,
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                Error::unauthorized("token_expired")
            }
            _ => Error::unauthorized("token_invalid"),
        })
    }
}

//─────────────────────────────
//  Opaque codec
//─────────────────────────────

/// Random opaque value codec.
///
/// Values carry at least [`MIN_TOKEN_ENTROPY_BITS`] bits from the injected
/// [`RandomSource`] and encode nothing; validation goes through the token
/// store.
pub struct OpaqueCodec {
    random: Arc<dyn RandomSource>,
    bytes: usize,
}

impl OpaqueCodec {
    /// Create a codec emitting `entropy_bits` of randomness per value,
    /// floored at the framework minimum.
    pub fn new(random: Arc<dyn RandomSource>, entropy_bits: usize) -> Self {
        let bits = entropy_bits.max(MIN_TOKEN_ENTROPY_BITS);
        Self {
            random,
            bytes: bits.div_ceil(8),
        }
    }
}

#[async_trait]
impl TokenCodec for OpaqueCodec {
    async fn mint(&self, _claims: &Claims) -> Result<String> {
        let mut buf = vec![0u8; self.bytes];
        self.random.fill_bytes(&mut buf);
        Ok(hex::encode(buf))
    }

    async fn parse(&self, _raw: &str) -> Result<Claims> {
        Err(Error::unauthorized("opaque_token"))
    }
}
