//! The in-process bus implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use mandate_types::Clock;

use crate::event::{Event, EventAction, EventFilter, EventStatus, EventType};

//─────────────────────────────
//  Configuration & errors
//─────────────────────────────

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Suspend the publisher until space frees up (at-least-once).
    Block,
    /// Evict the oldest queued event to make room.
    DropOldest,
    /// Discard the incoming event.
    DropNewest,
}

/// Bus construction parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BusConfig {
    /// Default per-subscriber queue capacity.
    #[serde(rename = "buffer")]
    pub buffer: usize,
    /// Default overflow policy for subscribers that don't override it.
    #[serde(rename = "overflow")]
    pub overflow: OverflowPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer: 1024,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Errors surfaced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The bus has been closed; no further publishes are accepted.
    #[error("event bus closed")]
    Closed,
    /// The subscription does not exist (already unsubscribed?).
    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),
}

/// Handle identifying a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

//─────────────────────────────
//  Handlers
//─────────────────────────────

/// A subscriber's event handler.
///
/// Runs on the subscriber's dedicated worker. Errors and panics are caught
/// and counted there; they never propagate to publishers or to other
/// subscribers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one delivered event.
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> impl EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

//─────────────────────────────
//  Subscriber state
//─────────────────────────────

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    policy: OverflowPolicy,
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    /// Signalled when the queue gains an event.
    ready: Notify,
    /// Signalled when the queue frees a slot (Block publishers wait here).
    space: Notify,
    cancel: CancellationToken,
    dropped: AtomicU64,
    failures: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    /// Enqueue under this subscriber's overflow policy.
    ///
    /// Returns the number of events lost doing so (0 or 1). Only the
    /// `Block` arm ever awaits.
    async fn enqueue(&self, event: Event) -> u64 {
        match self.policy {
            OverflowPolicy::Block => {
                loop {
                    if self.cancel.is_cancelled() {
                        return 0;
                    }
                    if self.try_push(event.clone()) {
                        return 0;
                    }
                    // Register interest before re-checking so a slot freed
                    // in between cannot be missed.
                    let notified = self.space.notified();
                    if self.try_push(event.clone()) {
                        return 0;
                    }
                    tokio::select! {
                        _ = notified => {}
                        _ = self.cancel.cancelled() => return 0,
                    }
                }
            }
            OverflowPolicy::DropOldest => {
                let mut lost = 0;
                {
                    let mut queue = self.queue.lock();
                    if queue.len() >= self.capacity {
                        queue.pop_front();
                        lost = 1;
                    }
                    queue.push_back(event);
                }
                self.ready.notify_one();
                if lost > 0 {
                    self.dropped.fetch_add(lost, Ordering::Relaxed);
                }
                lost
            }
            OverflowPolicy::DropNewest => {
                let lost = {
                    let mut queue = self.queue.lock();
                    if queue.len() >= self.capacity {
                        1
                    } else {
                        queue.push_back(event);
                        0
                    }
                };
                if lost > 0 {
                    self.dropped.fetch_add(lost, Ordering::Relaxed);
                } else {
                    self.ready.notify_one();
                }
                lost
            }
        }
    }

    fn try_push(&self, event: Event) -> bool {
        let pushed = {
            let mut queue = self.queue.lock();
            if queue.len() < self.capacity {
                queue.push_back(event);
                true
            } else {
                false
            }
        };
        if pushed {
            self.ready.notify_one();
        }
        pushed
    }

    fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

//─────────────────────────────
//  Bus
//─────────────────────────────

struct BusInner {
    config: BusConfig,
    clock: Arc<dyn Clock>,
    subscribers: RwLock<HashMap<SubscriptionId, Arc<Subscriber>>>,
    closed: AtomicBool,
    dropped_total: AtomicU64,
    handler_failures: AtomicU64,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    /// Live subscriber count.
    pub subscribers: usize,
    /// Events lost to overflow policies (including forced drops at close).
    pub dropped: u64,
    /// Handler errors and panics caught across all subscribers.
    pub handler_failures: u64,
}

/// Typed in-process publish/subscribe bus.
///
/// Cheap to clone; all clones share the same subscriber set.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the given defaults and clock (the clock stamps
    /// sentinel events only; regular events are stamped by their emitters).
    pub fn new(config: BusConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                clock,
                subscribers: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                dropped_total: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event to every matching subscriber.
    ///
    /// Only subscribers with the `Block` policy can make this await; drop
    /// policies record the loss and surface it through an `events.dropped`
    /// sentinel.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let targets: Vec<Arc<Subscriber>> = {
            let subs = self.inner.subscribers.read();
            subs.values()
                .filter(|s| s.filter.matches(&event))
                .cloned()
                .collect()
        };

        let mut lost = 0u64;
        for sub in &targets {
            lost += sub.enqueue(event.clone()).await;
        }

        if lost > 0 {
            self.inner.dropped_total.fetch_add(lost, Ordering::Relaxed);
            debug!(count = lost, event = event.name(), "events dropped on overflow");
            // Sentinels never beget sentinels.
            if !event.is_sentinel() {
                self.inner.emit_sentinel(
                    EventAction::EventsDropped,
                    event.subject.clone(),
                    format!("{lost} event(s) dropped delivering {}", event.name()),
                );
            }
        }

        Ok(())
    }

    /// Subscribe with the bus-default queue capacity and overflow policy.
    pub fn subscribe(
        &self,
        filter: EventFilter,
        handler: impl EventHandler + 'static,
    ) -> SubscriptionId {
        let buffer = self.inner.config.buffer;
        let overflow = self.inner.config.overflow;
        self.subscribe_with(filter, handler, overflow, buffer)
    }

    /// Subscribe with an explicit overflow policy and queue capacity.
    pub fn subscribe_with(
        &self,
        filter: EventFilter,
        handler: impl EventHandler + 'static,
        policy: OverflowPolicy,
        capacity: usize,
    ) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        let sub = Arc::new(Subscriber {
            id,
            filter,
            policy,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            space: Notify::new(),
            cancel: CancellationToken::new(),
            dropped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            worker: Mutex::new(None),
        });

        let worker = tokio::spawn(run_subscriber(
            sub.clone(),
            Arc::new(handler),
            Arc::downgrade(&self.inner),
        ));
        *sub.worker.lock() = Some(worker);

        self.inner.subscribers.write().insert(id, sub);
        id
    }

    /// Remove a subscription.
    ///
    /// After return the subscriber receives no further events; its worker
    /// is cancelled (an in-flight handler is aborted).
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        let sub = self
            .inner
            .subscribers
            .write()
            .remove(&id)
            .ok_or(BusError::UnknownSubscription(id))?;
        sub.cancel.cancel();
        // Wake anything parked on this subscriber.
        sub.space.notify_waiters();
        sub.ready.notify_waiters();
        let handle = sub.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Close the bus: refuse new publishes, drain queues within `grace`,
    /// then force-drop whatever remains (counted) and stop all workers.
    pub async fn close(&self, grace: Duration) {
        self.inner.closed.store(true, Ordering::Release);

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let pending: usize = {
                let subs = self.inner.subscribers.read();
                subs.values().map(|s| s.pending()).sum()
            };
            if pending == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let mut forced = 0u64;
                let subs = self.inner.subscribers.read();
                for sub in subs.values() {
                    let mut queue = sub.queue.lock();
                    forced += queue.len() as u64;
                    queue.clear();
                }
                drop(subs);
                if forced > 0 {
                    self.inner.dropped_total.fetch_add(forced, Ordering::Relaxed);
                    warn!(count = forced, "force-dropped events at bus close");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let subs: Vec<Arc<Subscriber>> =
            self.inner.subscribers.write().drain().map(|(_, s)| s).collect();
        for sub in subs {
            sub.cancel.cancel();
            sub.space.notify_waiters();
            sub.ready.notify_waiters();
            let handle = sub.worker.lock().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
    }

    /// Current observability counters.
    pub fn stats(&self) -> BusStats {
        BusStats {
            subscribers: self.inner.subscribers.read().len(),
            dropped: self.inner.dropped_total.load(Ordering::Relaxed),
            handler_failures: self.inner.handler_failures.load(Ordering::Relaxed),
        }
    }
}

impl BusInner {
    /// Non-awaiting sentinel emission used from publish bookkeeping and
    /// subscriber workers. Delivered with drop-newest semantics so a
    /// degradation signal can never wedge the bus.
    fn emit_sentinel(&self, action: EventAction, subject: String, message: String) {
        let event = Event::new(
            EventType::Sentinel,
            action,
            EventStatus::Failure,
            self.clock.timestamp(),
        )
        .with_subject(subject)
        .with_message(message);

        let subs = self.subscribers.read();
        for sub in subs.values().filter(|s| s.filter.matches(&event)) {
            let lost = {
                let mut queue = sub.queue.lock();
                if queue.len() >= sub.capacity {
                    true
                } else {
                    queue.push_back(event.clone());
                    false
                }
            };
            if lost {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
            } else {
                sub.ready.notify_one();
            }
        }
    }
}

async fn run_subscriber(
    sub: Arc<Subscriber>,
    handler: Arc<dyn EventHandler + 'static>,
    bus: Weak<BusInner>,
) {
    loop {
        let next = sub.queue.lock().pop_front();
        match next {
            Some(event) => {
                sub.space.notify_one();
                let outcome = tokio::select! {
                    biased;
                    _ = sub.cancel.cancelled() => return,
                    out = std::panic::AssertUnwindSafe(handler.handle(event)).catch_unwind() => out,
                };
                let failed = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(format!("handler error: {err:#}")),
                    Err(_) => Some("handler panicked".to_string()),
                };
                if let Some(reason) = failed {
                    sub.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(subscriber = %sub.id, %reason, "subscriber handler failed");
                    if let Some(bus) = bus.upgrade() {
                        bus.handler_failures.fetch_add(1, Ordering::Relaxed);
                        bus.emit_sentinel(
                            EventAction::SubscriberFailed,
                            sub.id.to_string(),
                            reason,
                        );
                    }
                }
            }
            None => {
                let notified = sub.ready.notified();
                if !sub.queue.lock().is_empty() {
                    continue;
                }
                tokio::select! {
                    _ = notified => {}
                    _ = sub.cancel.cancelled() => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mandate_types::{ManualClock, SystemClock};
    use std::sync::atomic::AtomicUsize;

    fn test_bus() -> EventBus {
        EventBus::new(BusConfig::default(), Arc::new(SystemClock::new()))
    }

    fn sample_event(subject: &str) -> Event {
        let clock = ManualClock::new();
        Event::new(
            EventType::Token,
            EventAction::TokenIssued,
            EventStatus::Success,
            clock.timestamp(),
        )
        .with_subject(subject)
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = test_bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(
            EventFilter::all(),
            handler_fn(move |e: Event| {
                let seen = seen2.clone();
                async move {
                    seen.lock().push(e.message.clone());
                    Ok(())
                }
            }),
        );

        for i in 0..20 {
            bus.publish(sample_event("s").with_message(format!("m{i}")))
                .await
                .unwrap();
        }
        bus.close(Duration::from_secs(1)).await;

        let got = seen.lock().clone();
        let want: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn filter_selects_subscribers() {
        let bus = test_bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        bus.subscribe(
            EventFilter::all().subjects(["alice"]),
            handler_fn(move |_| {
                let hits = hits2.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        bus.publish(sample_event("alice")).await.unwrap();
        bus.publish(sample_event("bob")).await.unwrap();
        bus.close(Duration::from_secs(1)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_failure_is_isolated_and_counted() {
        let bus = test_bus();
        let healthy_hits = Arc::new(AtomicUsize::new(0));
        let hits2 = healthy_hits.clone();

        bus.subscribe(
            EventFilter::all().types([EventType::Token]),
            handler_fn(|_| async { anyhow::bail!("boom") }),
        );
        bus.subscribe(
            EventFilter::all().types([EventType::Token]),
            handler_fn(move |_| {
                let hits = hits2.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        bus.publish(sample_event("s")).await.unwrap();
        bus.publish(sample_event("s")).await.unwrap();
        bus.close(Duration::from_secs(1)).await;

        assert_eq!(healthy_hits.load(Ordering::SeqCst), 2);
        assert_eq!(bus.stats().handler_failures, 2);
    }

    #[tokio::test]
    async fn drop_newest_counts_losses() {
        let bus = test_bus();
        let gate = Arc::new(Notify::new());
        let gate2 = gate.clone();
        bus.subscribe_with(
            EventFilter::all().types([EventType::Token]),
            handler_fn(move |_| {
                let gate = gate2.clone();
                async move {
                    gate.notified().await;
                    Ok(())
                }
            }),
            OverflowPolicy::DropNewest,
            2,
        );

        // Worker pulls one event and parks in the handler; two more fill the
        // queue; everything after that is dropped.
        for _ in 0..6 {
            bus.publish(sample_event("s")).await.unwrap();
        }
        tokio::task::yield_now().await;
        assert!(bus.stats().dropped >= 3);
        gate.notify_waiters();
        bus.close(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = test_bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let id = bus.subscribe(
            EventFilter::all(),
            handler_fn(move |_| {
                let hits = hits2.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        bus.publish(sample_event("s")).await.unwrap();
        // Let the worker drain before tearing the subscription down.
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.unsubscribe(id).await.unwrap();
        let before = hits.load(Ordering::SeqCst);

        bus.publish(sample_event("s")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), before);
        assert_eq!(bus.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn publish_after_close_is_refused() {
        let bus = test_bus();
        bus.close(Duration::from_millis(10)).await;
        let err = bus.publish(sample_event("s")).await.unwrap_err();
        assert!(matches!(err, BusError::Closed));
    }

    #[tokio::test]
    async fn subscriber_only_sees_events_after_subscribe() {
        let bus = test_bus();
        bus.publish(sample_event("before")).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(
            EventFilter::all(),
            handler_fn(move |e: Event| {
                let seen = seen2.clone();
                async move {
                    seen.lock().push(e.subject.clone());
                    Ok(())
                }
            }),
        );

        bus.publish(sample_event("after")).await.unwrap();
        bus.close(Duration::from_secs(1)).await;
        assert_eq!(seen.lock().clone(), vec!["after".to_string()]);
    }
}
