//! End-to-end scenarios: the full pipeline wired over the in-memory
//! store, the event bus, an audit sink, and the composite guard.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use mandate_audit::{canonical_bytes, AuditService, MemoryAuditSink};
use mandate_auth::{
    AuthConfig, AuthService, AuthorizationRequest, Claims, OpaqueCodec, TokenRequest,
};
use mandate_bus_core::{
    handler_fn, BusConfig, Event, EventAction, EventBus, EventFilter, EventType,
};
use mandate_processor::{
    ProcessorConfig, RecordingExecutor, Transaction, TransactionExecutor, TransactionProcessor,
};
use mandate_rate_limiter::{Algorithm, RateLimitConfig, TokenBucketLimiter};
use mandate_resilience::{BreakerConfig, BulkheadConfig, Composite, ResilienceConfig, RetryConfig};
use mandate_store_core::TokenStore;
use mandate_store_memory::MemoryTokenStore;
use mandate_types::{
    Error, ManualClock, OpContext, Restriction, ScopeSet, SystemRandom,
};

struct Fixture {
    clock: Arc<ManualClock>,
    store: Arc<MemoryTokenStore>,
    bus: EventBus,
    sink: Arc<MemoryAuditSink>,
    _audit: AuditService,
    auth: Arc<AuthService>,
    collected: Arc<Mutex<Vec<Event>>>,
}

impl Fixture {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryTokenStore::new(clock.clone()));
        let bus = EventBus::new(BusConfig::default(), clock.clone());

        let sink = Arc::new(MemoryAuditSink::new(b"scenario-key".to_vec()));
        let audit = AuditService::attach(&bus, sink.clone(), clock.clone(), 5);

        let collected = Arc::new(Mutex::new(Vec::new()));
        let collected2 = collected.clone();
        bus.subscribe(
            EventFilter::all(),
            handler_fn(move |event: Event| {
                let collected = collected2.clone();
                async move {
                    collected.lock().push(event);
                    Ok(())
                }
            }),
        );

        let codec = Arc::new(OpaqueCodec::new(Arc::new(SystemRandom), 128));
        let auth = Arc::new(
            AuthService::new(
                AuthConfig::default(),
                store.clone(),
                codec,
                clock.clone(),
                bus.clone(),
            )
            .unwrap(),
        );

        Self {
            clock,
            store,
            bus,
            sink,
            _audit: audit,
            auth,
            collected,
        }
    }

    fn processor(
        &self,
        executor: Arc<dyn TransactionExecutor>,
        limiter: Option<TokenBucketLimiter>,
        resilience: ResilienceConfig,
    ) -> TransactionProcessor {
        let mut guard = Composite::new(resilience, self.clock.clone());
        if let Some(limiter) = limiter {
            guard = guard.with_rate_limiter(Arc::new(limiter));
        }
        TransactionProcessor::new(
            self.auth.clone(),
            guard,
            executor,
            self.bus.clone(),
            self.clock.clone(),
            ProcessorConfig::default(),
        )
    }

    async fn issue_token(&self, restrictions: Vec<Restriction>) -> String {
        let ctx = OpContext::background();
        let mut req = AuthorizationRequest::new("demo", ScopeSet::new(["tx:exec"]));
        for r in restrictions {
            req = req.with_restriction(r);
        }
        let grant = self.auth.initiate_authorization(&ctx, req).await.unwrap();
        self.auth
            .request_token(&ctx, TokenRequest::new(grant.id))
            .await
            .unwrap()
            .token
            .value
    }

    async fn settle(&self) {
        // Let the subscriber workers drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn collected_actions(&self) -> Vec<EventAction> {
        self.collected.lock().iter().map(|e| e.action).collect()
    }
}

fn default_resilience() -> ResilienceConfig {
    ResilienceConfig {
        retry: RetryConfig {
            max_attempts: 1,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(1),
            multiplier: 1.0,
        },
        ..Default::default()
    }
}

struct FlakyExecutor {
    failing: AtomicBool,
    calls: AtomicU32,
}

impl FlakyExecutor {
    fn new(failing: bool) -> Self {
        Self {
            failing: AtomicBool::new(failing),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TransactionExecutor for FlakyExecutor {
    async fn execute(&self, _tx: &Transaction, _claims: &Claims) -> mandate_types::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::unavailable("executor down"))
        } else {
            Ok("executed".to_string())
        }
    }
}

#[tokio::test]
async fn scenario_happy_path_with_ordered_audit_trail() {
    let f = Fixture::new();
    let executor = Arc::new(RecordingExecutor::new());
    let processor = f.processor(executor.clone(), None, default_resilience());

    let token = f.issue_token(vec![]).await;
    let record = processor
        .process(
            &OpContext::background(),
            Transaction::new("tx-1", "payment").with_amount(50.0, "USD"),
            &token,
        )
        .await
        .unwrap();

    assert_eq!(record.outcome, "executed");
    assert_eq!(executor.executed(), vec!["tx-1".to_string()]);

    f.settle().await;
    f.bus.close(Duration::from_secs(1)).await;

    // The pipeline's three events, in causal order.
    assert_eq!(
        f.collected_actions(),
        vec![
            EventAction::GrantIssued,
            EventAction::TokenIssued,
            EventAction::TransactionProcessed,
        ]
    );

    // The audit sink saw the same order under strictly increasing
    // sequence numbers, byte-for-byte what was published.
    let records = f.sink.records();
    assert_eq!(records.len(), 3);
    assert!(f.sink.verify_all());
    let collected = f.collected.lock();
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.seq, i as u64);
        assert_eq!(record.bytes, canonical_bytes(&collected[i]));
    }
}

#[tokio::test]
async fn scenario_expired_token_is_rejected_without_processing() {
    let f = Fixture::new();
    let executor = Arc::new(RecordingExecutor::new());
    let processor = f.processor(executor.clone(), None, default_resilience());

    let token = f.issue_token(vec![]).await;
    f.clock.advance(Duration::from_secs(3601));

    let err = processor
        .process(
            &OpContext::background(),
            Transaction::new("tx-1", "payment").with_amount(50.0, "USD"),
            &token,
        )
        .await
        .unwrap_err();

    assert_eq!(err, Error::unauthorized("token_expired"));
    assert_eq!(executor.count(), 0);

    f.settle().await;
    f.bus.close(Duration::from_secs(1)).await;
    assert!(!f
        .collected_actions()
        .contains(&EventAction::TransactionProcessed));
}

#[tokio::test]
async fn scenario_revoked_token_disappears_immediately() {
    let f = Fixture::new();
    let executor = Arc::new(RecordingExecutor::new());
    let processor = f.processor(executor.clone(), None, default_resilience());
    let ctx = OpContext::background();

    let token = f.issue_token(vec![]).await;
    assert_eq!(f.store.list_by_owner("demo").await.unwrap().len(), 1);

    f.auth.revoke_token(&ctx, &token, "abuse").await.unwrap();

    let err = f.auth.validate_token(&ctx, &token).await.unwrap_err();
    assert_eq!(err, Error::unauthorized("token_revoked"));
    assert!(f.store.list_by_owner("demo").await.unwrap().is_empty());

    let err = processor
        .process(&ctx, Transaction::new("tx-1", "payment"), &token)
        .await
        .unwrap_err();
    assert_eq!(err, Error::unauthorized("token_revoked"));
    assert_eq!(executor.count(), 0);
    f.bus.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn scenario_token_bucket_burst_then_refill() {
    let f = Fixture::new();
    let executor = Arc::new(RecordingExecutor::new());
    let limiter = TokenBucketLimiter::new(
        &RateLimitConfig {
            algorithm: Algorithm::TokenBucket,
            limit: 0,
            window: Duration::from_secs(1),
            rps: 5.0,
            burst: 10,
        },
        f.clock.clone(),
    );
    let processor = f.processor(executor.clone(), Some(limiter), default_resilience());
    let ctx = OpContext::background();
    let token = f.issue_token(vec![]).await;

    // The full burst admits.
    for i in 0..10 {
        processor
            .process(&ctx, Transaction::new(format!("tx-{i}"), "payment"), &token)
            .await
            .unwrap();
    }

    // The 11th is rejected with the time to the next token.
    let err = processor
        .process(&ctx, Transaction::new("tx-10", "payment"), &token)
        .await
        .unwrap_err();
    match err {
        Error::RateLimited { retry_after } => {
            assert_eq!(retry_after, Duration::from_secs_f64(0.2));
        }
        other => panic!("expected rate limited, got {other:?}"),
    }
    assert_eq!(executor.count(), 10);

    // One second later the bucket holds five tokens again.
    f.clock.advance(Duration::from_secs(1));
    for i in 20..25 {
        processor
            .process(&ctx, Transaction::new(format!("tx-{i}"), "payment"), &token)
            .await
            .unwrap();
    }
    assert!(processor
        .process(&ctx, Transaction::new("tx-25", "payment"), &token)
        .await
        .is_err());
    f.bus.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn scenario_circuit_trips_then_recovers_through_probe() {
    let f = Fixture::new();
    let executor = Arc::new(FlakyExecutor::new(true));
    let resilience = ResilienceConfig {
        breaker: BreakerConfig {
            failure_threshold: 5,
            success_threshold: 1,
            open_duration: Duration::from_secs(30),
            probe_concurrency: 1,
        },
        retry: RetryConfig {
            max_attempts: 1,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(1),
            multiplier: 1.0,
        },
        bulkhead: BulkheadConfig { max_concurrent: 4 },
    };
    let processor = f.processor(executor.clone(), None, resilience);
    let ctx = OpContext::background();
    let token = f.issue_token(vec![]).await;

    // Five failing calls trip the breaker on the fifth.
    for i in 0..5 {
        let err = processor
            .process(&ctx, Transaction::new(format!("tx-{i}"), "payment"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }), "call {i}: {err:?}");
    }
    assert_eq!(executor.calls.load(Ordering::SeqCst), 5);

    // The sixth fails fast without invoking the executor.
    let err = processor
        .process(&ctx, Transaction::new("tx-6", "payment"), &token)
        .await
        .unwrap_err();
    assert_eq!(err, Error::CircuitOpen);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 5);

    // After the open duration one probe is admitted; its success closes
    // the circuit (success threshold 1).
    f.clock.advance(Duration::from_secs(30));
    executor.failing.store(false, Ordering::SeqCst);
    processor
        .process(&ctx, Transaction::new("tx-7", "payment"), &token)
        .await
        .unwrap();
    processor
        .process(&ctx, Transaction::new("tx-8", "payment"), &token)
        .await
        .unwrap();
    f.bus.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn scenario_amount_cap_denies_and_audits_both() {
    let f = Fixture::new();
    let executor = Arc::new(RecordingExecutor::new());
    let processor = f.processor(executor.clone(), None, default_resilience());
    let ctx = OpContext::background();

    let token = f
        .issue_token(vec![Restriction::AmountCap {
            currency: "USD".into(),
            max: 100.0,
        }])
        .await;

    processor
        .process(
            &ctx,
            Transaction::new("tx-ok", "payment").with_amount(50.0, "USD"),
            &token,
        )
        .await
        .unwrap();

    let err = processor
        .process(
            &ctx,
            Transaction::new("tx-over", "payment").with_amount(150.0, "USD"),
            &token,
        )
        .await
        .unwrap_err();
    match err {
        Error::Forbidden { code, .. } => assert_eq!(code, "amount_cap"),
        other => panic!("expected forbidden, got {other:?}"),
    }
    assert_eq!(executor.executed(), vec!["tx-ok".to_string()]);

    f.settle().await;
    f.bus.close(Duration::from_secs(1)).await;

    // Both outcomes hit the audit trail.
    let collected = f.collected.lock();
    let tx_events: Vec<&Event> = collected
        .iter()
        .filter(|e| e.event_type == EventType::Transaction)
        .collect();
    assert_eq!(tx_events.len(), 2);
    assert_eq!(tx_events[0].resource, "tx-ok");
    assert!(tx_events[0].error.is_none());
    assert_eq!(tx_events[1].resource, "tx-over");
    assert_eq!(tx_events[1].error.as_deref(), Some("amount_cap"));
    assert_eq!(f.sink.len(), collected.len());
    assert!(f.sink.verify_all());
}

#[tokio::test]
async fn duplicate_transaction_id_replays_the_original_result() {
    let f = Fixture::new();
    let executor = Arc::new(RecordingExecutor::new());
    let processor = f.processor(executor.clone(), None, default_resilience());
    let ctx = OpContext::background();
    let token = f.issue_token(vec![]).await;

    let tx = Transaction::new("tx-dup", "payment").with_amount(10.0, "USD");
    let first = processor.process(&ctx, tx.clone(), &token).await.unwrap();
    let second = processor.process(&ctx, tx.clone(), &token).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(executor.count(), 1);

    // Outside the idempotency window the transaction executes afresh.
    f.clock.advance(Duration::from_secs(24 * 60 * 60 + 1));
    processor.sweep();
    // The token has long expired by then; reissue one.
    let token = f.issue_token(vec![]).await;
    processor.process(&ctx, tx, &token).await.unwrap();
    assert_eq!(executor.count(), 2);
    f.bus.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn failed_processing_is_not_cached_for_replay() {
    let f = Fixture::new();
    let executor = Arc::new(FlakyExecutor::new(true));
    let processor = f.processor(executor.clone(), None, default_resilience());
    let ctx = OpContext::background();
    let token = f.issue_token(vec![]).await;

    let tx = Transaction::new("tx-retry", "payment");
    let err = processor.process(&ctx, tx.clone(), &token).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable { .. }));
    assert_eq!(processor.tracked(), 0);

    executor.failing.store(false, Ordering::SeqCst);
    processor.process(&ctx, tx, &token).await.unwrap();
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    f.bus.close(Duration::from_secs(1)).await;
}
