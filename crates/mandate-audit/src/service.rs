//! Bus-to-sink bridge.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use mandate_bus_core::{
    handler_fn, Event, EventAction, EventBus, EventFilter, EventStatus, EventType, SubscriptionId,
};
use mandate_types::Clock;

use crate::sink::{AuditSink, SinkError};

struct Bridge {
    sink: Arc<dyn AuditSink>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    unhealthy: AtomicBool,
    pending: Mutex<VecDeque<Event>>,
}

impl Bridge {
    /// Append one event, keeping delivery order: anything still queued
    /// from earlier failures goes first, and a failure requeues.
    async fn on_event(&self, event: Event) {
        loop {
            let queued = self.pending.lock().pop_front();
            match queued {
                Some(prev) => {
                    if !self.try_append(&prev).await {
                        let mut pending = self.pending.lock();
                        pending.push_front(prev);
                        pending.push_back(event);
                        drop(pending);
                        self.escalate_if_needed();
                        return;
                    }
                }
                None => break,
            }
        }

        if !self.try_append(&event).await {
            self.pending.lock().push_back(event);
            self.escalate_if_needed();
        }
    }

    async fn try_append(&self, event: &Event) -> bool {
        match self.sink.append(event).await {
            Ok(_seq) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                if self.unhealthy.swap(false, Ordering::AcqRel) {
                    info!("audit sink recovered");
                }
                true
            }
            Err(SinkError::Unavailable(reason)) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%reason, "audit append failed, record requeued");
                false
            }
            Err(SinkError::Fatal(reason)) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                error!(%reason, "audit append failed fatally");
                false
            }
        }
    }

    fn escalate_if_needed(&self) {
        if self.consecutive_failures.load(Ordering::Relaxed) < self.failure_threshold {
            return;
        }
        if self.unhealthy.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("audit sink marked unhealthy");
        let event = Event::new(
            EventType::Sentinel,
            EventAction::SinkUnhealthy,
            EventStatus::Failure,
            self.clock.timestamp(),
        )
        .with_message("audit sink failure threshold exceeded");
        // Publish from a detached task; the subscriber worker emitting
        // this must keep draining its own queue.
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let _ = bus.publish(event).await;
        });
    }
}

/// Subscribes broadly to the event bus and appends everything to a sink.
///
/// Transient sink failures requeue the record and preserve order;
/// `failure_threshold` consecutive failures escalate to an
/// `audit.sink.unhealthy` sentinel on the bus and mark the service
/// degraded until an append succeeds again.
pub struct AuditService {
    bridge: Arc<Bridge>,
    subscription: SubscriptionId,
    bus: EventBus,
}

impl AuditService {
    /// Attach a sink to `bus` with the given escalation threshold.
    pub fn attach(
        bus: &EventBus,
        sink: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        failure_threshold: u32,
    ) -> Self {
        let bridge = Arc::new(Bridge {
            sink,
            bus: bus.clone(),
            clock,
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            unhealthy: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
        });

        let handler_bridge = bridge.clone();
        let subscription = bus.subscribe(
            EventFilter::all(),
            handler_fn(move |event: Event| {
                let bridge = handler_bridge.clone();
                async move {
                    bridge.on_event(event).await;
                    Ok(())
                }
            }),
        );

        Self {
            bridge,
            subscription,
            bus: bus.clone(),
        }
    }

    /// `false` once the failure threshold has been crossed and no append
    /// has succeeded since.
    pub fn is_healthy(&self) -> bool {
        !self.bridge.unhealthy.load(Ordering::Acquire)
    }

    /// Records currently waiting for a retry.
    pub fn pending(&self) -> usize {
        self.bridge.pending.lock().len()
    }

    /// Total append failures observed.
    pub fn total_failures(&self) -> u64 {
        self.bridge.total_failures.load(Ordering::Relaxed)
    }

    /// Try to drain the requeued records now; returns how many made it.
    pub async fn retry_pending(&self) -> usize {
        let mut drained = 0;
        loop {
            let next = self.bridge.pending.lock().pop_front();
            let Some(event) = next else { break };
            if self.bridge.try_append(&event).await {
                drained += 1;
            } else {
                self.bridge.pending.lock().push_front(event);
                break;
            }
        }
        drained
    }

    /// Stop receiving events. Requeued records are dropped with the
    /// service.
    pub async fn detach(self) {
        let _ = self.bus.unsubscribe(self.subscription).await;
    }
}
