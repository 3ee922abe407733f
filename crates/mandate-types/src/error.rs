//! Framework error taxonomy.
//!
//! Every condition surfaced across a component boundary maps onto one of
//! these kinds, each carrying a stable machine-readable wire code. The
//! resilience layer consults [`Error::is_retryable`] to decide whether a
//! failed call may be reattempted; transports map [`Error::wire_code`]
//! straight onto their own error envelopes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Crate-wide result helper.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error taxonomy shared by all Mandate components.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    /// Client-correctable input problem; never retried.
    #[error("validation failed on `{field}`: {code}")]
    ValidationFailed {
        /// The offending request field.
        field: String,
        /// Stable code naming the specific violation.
        code: String,
    },

    /// Authentication failure - missing, expired or revoked credential.
    #[error("unauthorized: {code}")]
    Unauthorized {
        /// Stable code naming the failure (`token_expired`, `revoked`, ...).
        code: String,
    },

    /// A restriction predicate denied the request.
    #[error("forbidden by `{code}`: {reason}")]
    Forbidden {
        /// Code of the restriction that fired.
        code: String,
        /// Human-readable deny reason.
        reason: String,
    },

    /// The referenced entity does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// The operation collides with existing state.
    #[error("conflict: {what}")]
    Conflict {
        /// What collided.
        what: String,
    },

    /// Admission control rejected the request.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// How long the caller should wait before retrying.
        retry_after: Duration,
    },

    /// The circuit breaker is open; the caller should back off.
    #[error("circuit open")]
    CircuitOpen,

    /// Transient storage or downstream outage; safe to retry.
    #[error("unavailable: {reason}")]
    Unavailable {
        /// What is unavailable.
        reason: String,
    },

    /// The operation's deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The operation was cancelled by its caller.
    #[error("cancelled")]
    Cancelled,

    /// Unexpected internal failure; logged and audited, never retried.
    #[error("internal error: {reason}")]
    Internal {
        /// Diagnostic description.
        reason: String,
    },
}

impl Error {
    /// Shorthand for a [`Error::ValidationFailed`].
    pub fn validation(field: impl Into<String>, code: impl Into<String>) -> Self {
        Error::ValidationFailed {
            field: field.into(),
            code: code.into(),
        }
    }

    /// Shorthand for an [`Error::Unauthorized`].
    pub fn unauthorized(code: impl Into<String>) -> Self {
        Error::Unauthorized { code: code.into() }
    }

    /// Shorthand for an [`Error::Forbidden`].
    pub fn forbidden(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Forbidden {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`Error::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Shorthand for an [`Error::Conflict`].
    pub fn conflict(what: impl Into<String>) -> Self {
        Error::Conflict { what: what.into() }
    }

    /// Shorthand for an [`Error::Unavailable`].
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Error::Unavailable {
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`Error::Internal`].
    pub fn internal(reason: impl Into<String>) -> Self {
        Error::Internal {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for the wire.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Error::ValidationFailed { .. } => "validation_failed",
            Error::Unauthorized { .. } => "unauthorized",
            Error::Forbidden { .. } => "forbidden",
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::RateLimited { .. } => "rate_limited",
            Error::CircuitOpen => "circuit_open",
            Error::Unavailable { .. } => "unavailable",
            Error::DeadlineExceeded => "deadline_exceeded",
            Error::Cancelled => "cancelled",
            Error::Internal { .. } => "internal",
        }
    }

    /// `true` for transient kinds the resilience layer may reattempt.
    ///
    /// Cancellation and deadline expiry are never retried: the caller has
    /// already given up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable { .. })
    }

    /// `true` when the condition terminates the caller's wait
    /// (cancellation or deadline expiry).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}
