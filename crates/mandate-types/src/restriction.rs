//! Restriction predicates.
//!
//! A restriction narrows a grant or token beyond its scope. Restrictions
//! form a sealed sum type; evaluation is a pure function of
//! `(restriction, context, now)` with no side effects. Predicates compose
//! with implicit AND in declaration order and the first deny wins.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::{MetaValue, Metadata};

//─────────────────────────────
//  Evaluation context
//─────────────────────────────

/// The request-side facts a restriction is evaluated against.
///
/// Built by the resource processor from an incoming transaction; restriction
/// evaluation never reaches outside this value and the supplied clock
/// reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionContext {
    /// Kind of operation being attempted (opaque, e.g. `payment`).
    pub kind: String,
    /// Monetary amount, when the transaction carries one.
    pub amount: Option<f64>,
    /// ISO currency code accompanying `amount`.
    pub currency: Option<String>,
    /// Source address of the caller, when known.
    pub source_ip: Option<IpAddr>,
    /// Wall-clock time the transaction was submitted.
    pub timestamp: DateTime<Utc>,
    /// Additional typed context.
    #[serde(default)]
    pub metadata: Metadata,
}

impl TransactionContext {
    /// Minimal context for a transaction of the given kind.
    pub fn new(kind: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            amount: None,
            currency: None,
            source_ip: None,
            timestamp,
            metadata: Metadata::new(),
        }
    }

    /// Attach an amount and currency.
    pub fn with_amount(mut self, amount: f64, currency: impl Into<String>) -> Self {
        self.amount = Some(amount);
        self.currency = Some(currency.into());
        self
    }

    /// Attach the caller's source address.
    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    /// Attach a typed metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

//─────────────────────────────
//  Decisions
//─────────────────────────────

/// Outcome of evaluating one restriction (or a whole chain).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    /// The request may proceed.
    Allow,
    /// The request is denied.
    Deny {
        /// Stable code of the restriction that fired.
        code: String,
        /// Human-readable reason.
        reason: String,
    },
}

impl Decision {
    /// Shorthand for a deny decision.
    pub fn deny(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Decision::Deny {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// `true` when the decision allows the request.
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

//─────────────────────────────
//  Custom predicate lookup
//─────────────────────────────

/// A caller-supplied predicate behind a [`Restriction::Custom`] key.
pub trait RestrictionPredicate: Send + Sync {
    /// Evaluate the predicate against the typed value stored in the
    /// restriction and the transaction context.
    fn evaluate(
        &self,
        value: &MetaValue,
        cx: &TransactionContext,
        now: DateTime<Utc>,
    ) -> Decision;
}

/// Resolves custom restriction keys to their predicates.
pub trait CustomLookup {
    /// Return the predicate registered for `key`, if any.
    fn lookup(&self, key: &str) -> Option<&dyn RestrictionPredicate>;
}

/// Lookup that knows no custom predicates; any `Custom` restriction denies.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCustom;

impl CustomLookup for NoCustom {
    fn lookup(&self, _key: &str) -> Option<&dyn RestrictionPredicate> {
        None
    }
}

//─────────────────────────────
//  The restriction sum type
//─────────────────────────────

/// A typed predicate narrowing a grant or token beyond its scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Restriction {
    /// Deny when `now` falls outside `[from, to)`.
    TimeWindow {
        /// Inclusive window start.
        from: DateTime<Utc>,
        /// Exclusive window end.
        to: DateTime<Utc>,
    },
    /// Deny when a transaction in `currency` exceeds `max`.
    AmountCap {
        /// ISO currency code the cap applies to.
        currency: String,
        /// Maximum permitted amount.
        max: f64,
    },
    /// Deny when the source address is inside none of the CIDRs.
    IpRange {
        /// Permitted networks.
        cidrs: Vec<IpNetwork>,
    },
    /// Deny when the transaction kind is not in the set.
    TransactionKinds {
        /// Permitted kinds.
        kinds: Vec<String>,
    },
    /// Opaque predicate looked up by key at evaluation time.
    Custom {
        /// Registry key of the predicate.
        key: String,
        /// Typed value handed to the predicate.
        value: MetaValue,
    },
}

impl Restriction {
    /// Stable code identifying the restriction variant in deny decisions
    /// and audit records.
    pub fn code(&self) -> &str {
        match self {
            Restriction::TimeWindow { .. } => "time_window",
            Restriction::AmountCap { .. } => "amount_cap",
            Restriction::IpRange { .. } => "ip_range",
            Restriction::TransactionKinds { .. } => "transaction_kind",
            Restriction::Custom { key, .. } => key,
        }
    }

    /// Evaluate this restriction against `cx` at time `now`.
    ///
    /// Pure and side-effect free. `Custom` variants are resolved through
    /// `custom`; an unknown key denies rather than silently allowing.
    pub fn evaluate(
        &self,
        cx: &TransactionContext,
        now: DateTime<Utc>,
        custom: &dyn CustomLookup,
    ) -> Decision {
        match self {
            Restriction::TimeWindow { from, to } => {
                if now < *from || now >= *to {
                    Decision::deny(
                        "time_window",
                        format!("now {now} outside window [{from}, {to})"),
                    )
                } else {
                    Decision::Allow
                }
            }
            Restriction::AmountCap { currency, max } => match (&cx.amount, &cx.currency) {
                (Some(amount), Some(tx_currency)) if tx_currency == currency => {
                    if *amount > *max {
                        Decision::deny(
                            "amount_cap",
                            format!("amount {amount} {currency} exceeds cap {max}"),
                        )
                    } else {
                        Decision::Allow
                    }
                }
                // A cap in another currency does not constrain this tx.
                _ => Decision::Allow,
            },
            Restriction::IpRange { cidrs } => match cx.source_ip {
                Some(ip) if cidrs.iter().any(|net| net.contains(ip)) => Decision::Allow,
                Some(ip) => Decision::deny("ip_range", format!("source {ip} not in permitted ranges")),
                None => Decision::deny("ip_range", "source address unknown"),
            },
            Restriction::TransactionKinds { kinds } => {
                if kinds.iter().any(|k| k == &cx.kind) {
                    Decision::Allow
                } else {
                    Decision::deny(
                        "transaction_kind",
                        format!("kind `{}` not permitted", cx.kind),
                    )
                }
            }
            Restriction::Custom { key, value } => match custom.lookup(key) {
                Some(predicate) => predicate.evaluate(value, cx, now),
                None => Decision::deny(key.clone(), "unknown custom restriction"),
            },
        }
    }

    /// Whether this restriction is at least as tight as `other`.
    ///
    /// Returns `None` when the two are different variants (or different
    /// custom keys / currencies) and therefore not comparable. Used when a
    /// token request re-states a grant restriction: re-stating it *looser*
    /// is a narrowing conflict.
    pub fn tightens(&self, other: &Restriction) -> Option<bool> {
        match (self, other) {
            (
                Restriction::TimeWindow { from: f1, to: t1 },
                Restriction::TimeWindow { from: f2, to: t2 },
            ) => Some(f1 >= f2 && t1 <= t2),
            (
                Restriction::AmountCap { currency: c1, max: m1 },
                Restriction::AmountCap { currency: c2, max: m2 },
            ) => {
                if c1 == c2 {
                    Some(m1 <= m2)
                } else {
                    None
                }
            }
            (Restriction::IpRange { cidrs: a }, Restriction::IpRange { cidrs: b }) => {
                Some(a.iter().all(|net| b.iter().any(|outer| is_subnet(net, outer))))
            }
            (
                Restriction::TransactionKinds { kinds: a },
                Restriction::TransactionKinds { kinds: b },
            ) => Some(a.iter().all(|k| b.contains(k))),
            (
                Restriction::Custom { key: k1, value: v1 },
                Restriction::Custom { key: k2, value: v2 },
            ) => {
                if k1 == k2 {
                    // Opaque values: only identity is known to be safe.
                    Some(v1 == v2)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

fn is_subnet(inner: &IpNetwork, outer: &IpNetwork) -> bool {
    outer.contains(inner.network()) && outer.prefix() <= inner.prefix()
}

/// Evaluate a chain of restrictions in declaration order.
///
/// Implicit AND; the first deny short-circuits and is returned as the
/// decision. An empty chain allows.
pub fn evaluate_all(
    restrictions: &[Restriction],
    cx: &TransactionContext,
    now: DateTime<Utc>,
    custom: &dyn CustomLookup,
) -> Decision {
    for restriction in restrictions {
        let decision = restriction.evaluate(cx, now, custom);
        if !decision.is_allow() {
            return decision;
        }
    }
    Decision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn time_window_boundaries() {
        let r = Restriction::TimeWindow {
            from: at(0),
            to: at(60),
        };
        let cx = TransactionContext::new("payment", at(0));
        assert!(r.evaluate(&cx, at(0), &NoCustom).is_allow());
        assert!(r.evaluate(&cx, at(59), &NoCustom).is_allow());
        assert!(!r.evaluate(&cx, at(60), &NoCustom).is_allow());
        assert!(!r.evaluate(&cx, at(-1), &NoCustom).is_allow());
    }

    #[test]
    fn amount_cap_applies_per_currency() {
        let r = Restriction::AmountCap {
            currency: "USD".into(),
            max: 100.0,
        };
        let now = at(0);
        let under = TransactionContext::new("payment", now).with_amount(50.0, "USD");
        let exact = TransactionContext::new("payment", now).with_amount(100.0, "USD");
        let over = TransactionContext::new("payment", now).with_amount(150.0, "USD");
        let other = TransactionContext::new("payment", now).with_amount(150.0, "EUR");

        assert!(r.evaluate(&under, now, &NoCustom).is_allow());
        assert!(r.evaluate(&exact, now, &NoCustom).is_allow());
        assert!(!r.evaluate(&over, now, &NoCustom).is_allow());
        assert!(r.evaluate(&other, now, &NoCustom).is_allow());
    }

    #[test]
    fn ip_range_requires_known_source() {
        let r = Restriction::IpRange {
            cidrs: vec!["10.0.0.0/8".parse().unwrap()],
        };
        let now = at(0);
        let inside =
            TransactionContext::new("payment", now).with_source_ip("10.1.2.3".parse().unwrap());
        let outside =
            TransactionContext::new("payment", now).with_source_ip("192.168.0.1".parse().unwrap());
        let unknown = TransactionContext::new("payment", now);

        assert!(r.evaluate(&inside, now, &NoCustom).is_allow());
        assert!(!r.evaluate(&outside, now, &NoCustom).is_allow());
        assert!(!r.evaluate(&unknown, now, &NoCustom).is_allow());
    }

    #[test]
    fn first_deny_wins_in_order() {
        let now = at(0);
        let chain = vec![
            Restriction::TransactionKinds {
                kinds: vec!["transfer".into()],
            },
            Restriction::AmountCap {
                currency: "USD".into(),
                max: 10.0,
            },
        ];
        let cx = TransactionContext::new("payment", now).with_amount(100.0, "USD");
        let decision = evaluate_all(&chain, &cx, now, &NoCustom);
        match decision {
            Decision::Deny { code, .. } => assert_eq!(code, "transaction_kind"),
            Decision::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn unknown_custom_key_denies() {
        let r = Restriction::Custom {
            key: "geo_fence".into(),
            value: MetaValue::from("EU"),
        };
        let now = at(0);
        let cx = TransactionContext::new("payment", now);
        assert!(!r.evaluate(&cx, now, &NoCustom).is_allow());
    }

    #[test]
    fn tightening_comparisons() {
        let narrow = Restriction::AmountCap {
            currency: "USD".into(),
            max: 50.0,
        };
        let wide = Restriction::AmountCap {
            currency: "USD".into(),
            max: 100.0,
        };
        assert_eq!(narrow.tightens(&wide), Some(true));
        assert_eq!(wide.tightens(&narrow), Some(false));

        let eur = Restriction::AmountCap {
            currency: "EUR".into(),
            max: 10.0,
        };
        assert_eq!(eur.tightens(&wide), None);

        let inner = Restriction::TimeWindow {
            from: at(10),
            to: at(20),
        };
        let outer = Restriction::TimeWindow {
            from: at(0),
            to: at(60),
        };
        assert_eq!(inner.tightens(&outer), Some(true));
        assert_eq!(outer.tightens(&inner), Some(false));

        let sub = Restriction::IpRange {
            cidrs: vec!["10.1.0.0/16".parse().unwrap()],
        };
        let sup = Restriction::IpRange {
            cidrs: vec!["10.0.0.0/8".parse().unwrap()],
        };
        assert_eq!(sub.tightens(&sup), Some(true));
        assert_eq!(sup.tightens(&sub), Some(false));
    }

    #[test]
    fn empty_chain_allows() {
        let cx = TransactionContext::new("payment", at(0));
        assert!(evaluate_all(&[], &cx, at(0), &NoCustom).is_allow());
    }
}
