//! Transport integration contract.
//!
//! The core carries no HTTP framework dependency; this module exposes the
//! pieces a transport layer needs to wire a [`RateLimiter`](crate::RateLimiter)
//! into its middleware: the standard header set derived from a [`Quota`],
//! the `Retry-After` rounding rule, and a pluggable subject key extractor
//! (default: remote IP).

use std::net::IpAddr;
use std::time::Duration;

use crate::Quota;

/// `X-RateLimit-Limit` header name.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// `X-RateLimit-Remaining` header name.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// `X-RateLimit-Reset` header name.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// `Retry-After` header name.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Whole-second ceiling used for `Retry-After`.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// The rate-limit header values for one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Enforced limit.
    pub limit: u64,
    /// Remaining capacity.
    pub remaining: u64,
    /// Seconds until the quota resets (ceiling).
    pub reset_secs: u64,
}

impl RateLimitHeaders {
    /// Derive header values from a quota snapshot.
    pub fn from_quota(quota: &Quota) -> Self {
        Self {
            limit: quota.total,
            remaining: quota.remaining,
            reset_secs: retry_after_secs(quota.reset_after),
        }
    }

    /// Render as name/value pairs in a fixed order.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_secs.to_string()),
        ]
    }
}

/// The request facts available to subject key extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestInfo {
    /// Remote peer address.
    pub remote_ip: IpAddr,
    /// Authenticated client identity, when the transport knows one.
    pub client_id: Option<String>,
}

/// Pluggable mapping from a request to its rate-limit subject key.
pub trait KeyExtractor: Send + Sync {
    /// The subject key requests from `req` are throttled under.
    fn key(&self, req: &RequestInfo) -> String;
}

/// Default extractor: throttle per remote IP.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteIpKey;

impl KeyExtractor for RemoteIpKey {
    fn key(&self, req: &RequestInfo) -> String {
        format!("ip:{}", req.remote_ip)
    }
}

/// Throttle per authenticated client, falling back to the remote IP.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIdKey;

impl KeyExtractor for ClientIdKey {
    fn key(&self, req: &RequestInfo) -> String {
        match &req.client_id {
            Some(id) => format!("client:{id}"),
            None => RemoteIpKey.key(req),
        }
    }
}
