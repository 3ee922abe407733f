#![forbid(unsafe_code)]

//! **mandate-processor** – Resource-side transaction processing for Mandate.
//!
//! The processor is what a resource server runs: it takes an incoming
//! transaction plus the bearer token presented with it, validates the
//! token through the authorization core, evaluates the token's
//! restrictions against the transaction, and - only if allowed - executes
//! the business action under the composite guard (rate limit keyed on the
//! token's owner, bulkhead, circuit breaker, bounded retry). Completed
//! transactions are remembered under their id for an idempotency window,
//! so an LLM or network retry of the same transaction returns the
//! original result instead of executing twice.

mod executor;

pub use executor::{RecordingExecutor, TransactionExecutor};

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use mandate_auth::{AuthService, Claims};
use mandate_bus_core::{Event, EventAction, EventBus, EventStatus, EventType};
use mandate_resilience::Composite;
use mandate_types::{
    Clock, Decision, Error, MetaValue, Metadata, OpContext, Result, Timestamp, TransactionContext,
};

//─────────────────────────────
//  Transactions
//─────────────────────────────

/// An incoming transaction to apply against a live token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Idempotency key; duplicates inside the window replay the original
    /// result.
    pub id: String,
    /// Kind of operation (opaque, e.g. `payment`).
    pub kind: String,
    /// Monetary amount, when the transaction carries one.
    pub amount: Option<f64>,
    /// ISO currency code accompanying `amount`.
    pub currency: Option<String>,
    /// Source address of the caller, when known.
    pub source_ip: Option<IpAddr>,
    /// Additional typed context handed to restriction evaluation.
    #[serde(default)]
    pub metadata: Metadata,
}

impl Transaction {
    /// Minimal transaction of the given id and kind.
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            amount: None,
            currency: None,
            source_ip: None,
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

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::validation("id", "empty"));
        }
        if self.kind.is_empty() {
            return Err(Error::validation("kind", "empty"));
        }
        if let Some(amount) = self.amount {
            if !amount.is_finite() || amount < 0.0 {
                return Err(Error::validation("amount", "invalid"));
            }
        }
        Ok(())
    }
}

/// The durable outcome of a processed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    /// The transaction's id.
    pub tx_id: String,
    /// Owner the transaction was executed for.
    pub owner: String,
    /// Executor disposition (e.g. `executed`).
    pub outcome: String,
    /// Completion instant.
    pub completed_at: Timestamp,
}

//─────────────────────────────
//  Configuration & idempotency
//─────────────────────────────

/// Processor parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// How long completed results replay for duplicate ids.
    pub idempotency_window: Duration,
    /// How long an in-flight marker blocks duplicates before it is
    /// considered stale.
    pub in_flight_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            idempotency_window: Duration::from_secs(24 * 60 * 60),
            in_flight_timeout: Duration::from_secs(5 * 60),
        }
    }
}

enum IdemState {
    /// Executing now; holds the monotonic instant it was registered.
    InFlight(Duration),
    /// Done; holds the result and when it was stored.
    Completed(TxRecord, Duration),
}

//─────────────────────────────
//  The processor
//─────────────────────────────

/// Applies transactions against live tokens.
pub struct TransactionProcessor {
    auth: Arc<AuthService>,
    guard: Composite,
    executor: Arc<dyn TransactionExecutor>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
    entries: DashMap<String, IdemState>,
}

impl TransactionProcessor {
    /// Assemble a processor over an authorization core and a guard.
    pub fn new(
        auth: Arc<AuthService>,
        guard: Composite,
        executor: Arc<dyn TransactionExecutor>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            auth,
            guard,
            executor,
            bus,
            clock,
            config,
            entries: DashMap::new(),
        }
    }

    /// Process one transaction presented with `token_value`.
    ///
    /// Pipeline: validate token → build context → evaluate restrictions →
    /// execute under the composite guard keyed by the token's owner →
    /// remember the result under `tx.id` → emit `tx.processed`. A
    /// duplicate id inside the idempotency window returns the original
    /// result without re-executing; a duplicate of a transaction still in
    /// flight is refused as a conflict.
    pub async fn process(
        &self,
        ctx: &OpContext,
        tx: Transaction,
        token_value: &str,
    ) -> Result<TxRecord> {
        ctx.check()?;
        tx.validate()?;

        if let Some(replay) = self.claim_or_replay(&tx.id)? {
            debug!(tx = %tx.id, "idempotent replay");
            return Ok(replay);
        }

        match self.run(ctx, &tx, token_value).await {
            Ok(record) => {
                self.entries.insert(
                    tx.id.clone(),
                    IdemState::Completed(record.clone(), self.clock.monotonic()),
                );
                Ok(record)
            }
            Err(err) => {
                // Failures are not cached; release the in-flight marker so
                // the client may retry.
                self.entries.remove(&tx.id);
                Err(err)
            }
        }
    }

    /// Drop idempotency entries past their windows. Advisory; call
    /// periodically.
    pub fn sweep(&self) {
        let now = self.clock.monotonic();
        let window = self.config.idempotency_window;
        let in_flight = self.config.in_flight_timeout;
        self.entries.retain(|_, state| match state {
            IdemState::InFlight(started) => now.saturating_sub(*started) < in_flight,
            IdemState::Completed(_, stored) => now.saturating_sub(*stored) < window,
        });
    }

    /// Idempotency entries currently held.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    /// Atomically claim `tx_id` for execution, or return the completed
    /// result to replay.
    fn claim_or_replay(&self, tx_id: &str) -> Result<Option<TxRecord>> {
        let now = self.clock.monotonic();
        let mut replay = None;
        let mut conflict = false;

        let entry = self.entries.entry(tx_id.to_owned());
        entry
            .and_modify(|state| match state {
                IdemState::Completed(record, stored) => {
                    if now.saturating_sub(*stored) < self.config.idempotency_window {
                        replay = Some(record.clone());
                    } else {
                        *state = IdemState::InFlight(now);
                    }
                }
                IdemState::InFlight(started) => {
                    if now.saturating_sub(*started) < self.config.in_flight_timeout {
                        conflict = true;
                    } else {
                        // Stale marker from a crashed execution.
                        *state = IdemState::InFlight(now);
                    }
                }
            })
            .or_insert(IdemState::InFlight(now));

        if conflict {
            return Err(Error::conflict("transaction in flight"));
        }
        Ok(replay)
    }

    async fn run(&self, ctx: &OpContext, tx: &Transaction, token_value: &str) -> Result<TxRecord> {
        let claims = self.auth.validate_token(ctx, token_value).await?;
        let cx = self.build_context(tx);

        match self.auth.authorize(&claims, &cx) {
            Decision::Allow => {}
            Decision::Deny { code, reason } => {
                warn!(tx = %tx.id, owner = %claims.sub, %code, "transaction denied");
                self.emit_processed(tx, &claims.sub, EventStatus::Denied, Some(&code))
                    .await;
                return Err(Error::forbidden(code, reason));
            }
        }

        let outcome = self
            .guard
            .execute(ctx, &claims.sub, || self.executor.execute(tx, &claims))
            .await?;

        let record = TxRecord {
            tx_id: tx.id.clone(),
            owner: claims.sub.clone(),
            outcome,
            completed_at: self.clock.timestamp(),
        };
        info!(tx = %record.tx_id, owner = %record.owner, "transaction processed");
        self.emit_processed(tx, &record.owner, EventStatus::Success, None)
            .await;
        Ok(record)
    }

    fn build_context(&self, tx: &Transaction) -> TransactionContext {
        let mut cx = TransactionContext::new(tx.kind.clone(), self.clock.wall());
        if let (Some(amount), Some(currency)) = (tx.amount, tx.currency.clone()) {
            cx = cx.with_amount(amount, currency);
        }
        if let Some(ip) = tx.source_ip {
            cx = cx.with_source_ip(ip);
        }
        cx.metadata = tx.metadata.clone();
        cx
    }

    async fn emit_processed(
        &self,
        tx: &Transaction,
        owner: &str,
        status: EventStatus,
        error: Option<&str>,
    ) {
        let mut event = Event::new(
            EventType::Transaction,
            EventAction::TransactionProcessed,
            status,
            self.clock.timestamp(),
        )
        .with_subject(owner)
        .with_resource(tx.id.clone())
        .with_meta("kind", tx.kind.clone());
        if let Some(amount) = tx.amount {
            event = event.with_meta("amount", amount);
        }
        if let Some(currency) = &tx.currency {
            event = event.with_meta("currency", currency.clone());
        }
        if let Some(code) = error {
            event = event.with_error(code);
        }
        if let Err(err) = self.bus.publish(event).await {
            warn!(%err, "event publish failed");
        }
    }
}

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        ProcessorConfig, RecordingExecutor, Transaction, TransactionExecutor,
        TransactionProcessor, TxRecord,
    };
}
