#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mandate-types** – Shared primitive data structures for Mandate.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the vocabulary of the framework – scopes, restriction
//! predicates, typed metadata values, the error taxonomy – together with the
//! [`Clock`] and [`RandomSource`] contracts that keep time and entropy
//! injectable for tests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod context;
pub mod error;
pub mod random;
pub mod restriction;
pub mod time;

pub use context::OpContext;
pub use error::{Error, Result};
pub use random::{RandomSource, SystemRandom};
pub use restriction::{
    CustomLookup, Decision, NoCustom, Restriction, RestrictionPredicate, TransactionContext,
};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Maximum accepted length of a client identifier.
pub const MAX_CLIENT_ID_LEN: usize = 256;

/// Maximum accepted length of a single scope string.
pub const MAX_SCOPE_LEN: usize = 256;

/// Maximum number of restrictions accepted on a single request.
pub const MAX_RESTRICTIONS: usize = 64;

/// Minimum entropy carried by an opaque token value, in bits.
pub const MIN_TOKEN_ENTROPY_BITS: usize = 128;

//─────────────────────────────
//  Scope sets
//─────────────────────────────

/// An ordered, duplicate-free set of scope strings.
///
/// Scopes are opaque identifiers compared lexically. Insertion order is
/// preserved because restriction evaluation and auditing report scopes in
/// the order the client requested them; duplicates are collapsed on
/// construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(Vec<String>);

impl ScopeSet {
    /// Build a scope set from an iterator, collapsing duplicates while
    /// preserving first-seen order.
    pub fn new(scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut out: Vec<String> = Vec::new();
        for s in scopes {
            let s = s.into();
            if !out.contains(&s) {
                out.push(s);
            }
        }
        Self(out)
    }

    /// Number of scopes in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` when the set holds no scopes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lexical membership test.
    pub fn contains(&self, scope: &str) -> bool {
        self.0.iter().any(|s| s == scope)
    }

    /// `true` when every scope in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &ScopeSet) -> bool {
        self.0.iter().all(|s| other.contains(s))
    }

    /// Iterate scopes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Validate scope strings against size limits.
    pub fn validate(&self) -> Result<()> {
        for s in &self.0 {
            if s.is_empty() || s.len() > MAX_SCOPE_LEN {
                return Err(Error::validation("scopes", "scope_length"));
            }
        }
        Ok(())
    }
}

impl<S: Into<String>> FromIterator<S> for ScopeSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::new(iter)
    }
}

//─────────────────────────────
//  Typed metadata
//─────────────────────────────

/// Tagged metadata value.
///
/// Events and restriction contexts attach structured context as a mapping
/// from key to one of these variants rather than a free-form string map, so
/// consumers (and the audit canonical encoding) never have to guess at a
/// value's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum MetaValue {
    /// UTF-8 string value.
    Str(String),
    /// Signed 64-bit integer value.
    I64(i64),
    /// 64-bit floating point value.
    F64(f64),
    /// Boolean value.
    Bool(bool),
    /// Wall-clock timestamp value.
    Time(chrono::DateTime<chrono::Utc>),
    /// Raw byte value.
    Bytes(Vec<u8>),
}

impl MetaValue {
    /// String accessor; `None` for other variants.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer accessor; `None` for other variants.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Float accessor; `None` for other variants.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean accessor; `None` for other variants.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Timestamp accessor; `None` for other variants.
    pub fn as_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match self {
            MetaValue::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Byte accessor; `None` for other variants.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MetaValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Str(v.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Str(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::I64(v)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::F64(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

/// Metadata mapping attached to events and transaction contexts.
///
/// A `BTreeMap` keeps iteration order deterministic, which the audit
/// canonical encoding depends on.
pub type Metadata = BTreeMap<String, MetaValue>;

//─────────────────────────────
//  Convenience re-exports
//─────────────────────────────

/// Glob-import helper for downstream crates.
pub mod prelude {
    pub use super::{
        Clock, Decision, Error, ManualClock, MetaValue, Metadata, OpContext, RandomSource,
        Restriction, Result, ScopeSet, SystemClock, SystemRandom, Timestamp, TransactionContext,
    };
}
