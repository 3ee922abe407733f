#![forbid(unsafe_code)]

//! **mandate-auth** – The authorization core of Mandate.
//!
//! This crate owns the heart of the pipeline: an
//! [`AuthorizationRequest`] is validated into a short-lived [`Grant`];
//! the grant is exchanged exactly once for a bearer token minted through a
//! pluggable [`TokenCodec`]; presented tokens are validated back into
//! [`Claims`]; and per-request decisions come from evaluating the token's
//! restriction chain. Every state change is published on the event bus.
//!
//! Two codecs are bundled: [`JwtHs256Codec`] (self-describing HS256 JWTs)
//! and [`OpaqueCodec`] (random high-entropy values whose claims live only
//! in the token store). Either way the store stays authoritative for
//! validation, so revocation always wins over whatever a token says about
//! itself.

pub mod codec;
pub mod grant;
pub mod service;

pub use codec::{Claims, JwtHs256Codec, OpaqueCodec, TokenCodec};
pub use grant::{AuthorizationRequest, Grant, GrantStatus, TokenRequest, TokenResponse};
pub use service::{AuthConfig, AuthService, ConfigError};

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        AuthConfig, AuthService, AuthorizationRequest, Claims, Grant, GrantStatus, JwtHs256Codec,
        OpaqueCodec, TokenCodec, TokenRequest, TokenResponse,
    };
}
