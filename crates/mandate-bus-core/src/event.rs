//! The canonical event model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mandate_types::{MetaValue, Metadata, Timestamp};

//─────────────────────────────
//  Classification enums
//─────────────────────────────

/// Coarse family an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Authorization pipeline events (grants).
    Auth,
    /// Token lifecycle events.
    Token,
    /// Resource-side transaction events.
    Transaction,
    /// Audit subsystem events.
    Audit,
    /// System-emitted degradation signals.
    Sentinel,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// An authorization grant was issued.
    GrantIssued,
    /// A grant was exchanged for a token.
    TokenIssued,
    /// A token was revoked.
    TokenRevoked,
    /// A transaction was processed against a live token.
    TransactionProcessed,
    /// A subscriber's queue overflowed and events were lost.
    EventsDropped,
    /// A subscriber's handler failed or panicked.
    SubscriberFailed,
    /// An audit sink exceeded its failure threshold.
    SinkUnhealthy,
}

impl EventAction {
    /// Dotted wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            EventAction::GrantIssued => "auth.grant.issued",
            EventAction::TokenIssued => "token.issued",
            EventAction::TokenRevoked => "token.revoked",
            EventAction::TransactionProcessed => "tx.processed",
            EventAction::EventsDropped => "events.dropped",
            EventAction::SubscriberFailed => "subscriber.failed",
            EventAction::SinkUnhealthy => "audit.sink.unhealthy",
        }
    }
}

/// Outcome recorded with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// The operation succeeded.
    Success,
    /// The operation failed.
    Failure,
    /// The operation was denied by policy.
    Denied,
}

//─────────────────────────────
//  Event
//─────────────────────────────

/// A single immutable event.
///
/// Events are value-typed and shared by copy; once published they are
/// read-only. The `timestamp` carries both the monotonic offset used for
/// ordering comparisons and the wall-clock reading attached for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// Monotonic + wall-clock reading at emission.
    pub timestamp: Timestamp,
    /// Event family.
    pub event_type: EventType,
    /// What happened.
    pub action: EventAction,
    /// Outcome.
    pub status: EventStatus,
    /// Identity the event is about (client, owner, subscriber id).
    pub subject: String,
    /// Resource the event touches (grant id, token value hash, path).
    pub resource: String,
    /// Free-form human-readable message.
    pub message: String,
    /// Typed structured context.
    #[serde(default)]
    pub metadata: Metadata,
    /// Wire code of the error, for failure events.
    pub error: Option<String>,
}

impl Event {
    /// Create an event with a fresh id and empty context fields.
    pub fn new(
        event_type: EventType,
        action: EventAction,
        status: EventStatus,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            event_type,
            action,
            status,
            subject: String::new(),
            resource: String::new(),
            message: String::new(),
            metadata: Metadata::new(),
            error: None,
        }
    }

    /// Set the subject identity.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set the resource.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Set the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach a typed metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach an error wire code.
    pub fn with_error(mut self, code: impl Into<String>) -> Self {
        self.error = Some(code.into());
        self
    }

    /// Dotted wire name (`auth.grant.issued`, `tx.processed`, ...).
    pub fn name(&self) -> &'static str {
        self.action.name()
    }

    /// `true` for bus- or sink-emitted degradation signals.
    pub fn is_sentinel(&self) -> bool {
        self.event_type == EventType::Sentinel
    }
}

//─────────────────────────────
//  Filters
//─────────────────────────────

/// Predicate over `{type, action, status, subject}` selecting the events a
/// subscriber receives. Empty dimensions match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Accepted event families; `None` accepts all.
    pub types: Option<Vec<EventType>>,
    /// Accepted actions; `None` accepts all.
    pub actions: Option<Vec<EventAction>>,
    /// Accepted statuses; `None` accepts all.
    pub statuses: Option<Vec<EventStatus>>,
    /// Accepted subjects; `None` accepts all.
    pub subjects: Option<Vec<String>>,
}

impl EventFilter {
    /// The broad filter: matches every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to the given event families.
    pub fn types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    /// Restrict to the given actions.
    pub fn actions(mut self, actions: impl IntoIterator<Item = EventAction>) -> Self {
        self.actions = Some(actions.into_iter().collect());
        self
    }

    /// Restrict to the given statuses.
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = EventStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    /// Restrict to the given subjects.
    pub fn subjects(mut self, subjects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.subjects = Some(subjects.into_iter().map(Into::into).collect());
        self
    }

    /// Whether `event` passes the filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(actions) = &self.actions {
            if !actions.contains(&event.action) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&event.status) {
                return false;
            }
        }
        if let Some(subjects) = &self.subjects {
            if !subjects.iter().any(|s| s == &event.subject) {
                return false;
            }
        }
        true
    }
}
