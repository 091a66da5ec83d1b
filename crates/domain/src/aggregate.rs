//! Aggregate base and domain events.

use chrono::{DateTime, Utc};
use common::{AggregateId, Version};
use serde::{Deserialize, Serialize};

/// Payload carried by a domain event: either structured JSON or plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Structured(serde_json::Value),
}

impl Payload {
    /// Renders the payload the way it goes over the wire.
    ///
    /// Text is passed through untouched, structured payloads are JSON encoded.
    pub fn to_wire_string(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Structured(value) => value.to_string(),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Structured(value)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

/// A fact recorded by an aggregate mutation.
///
/// Events are immutable once built. They wait in the aggregate's queue until
/// the unit of work drains and publishes them on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    channel: String,
    payload: Payload,
    occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    /// Creates an event on `channel`.
    pub fn new(channel: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            occurred_at: Utc::now(),
        }
    }

    /// Returns the channel the event is published on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns the event payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns when the event was recorded.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Identity, version and pending events shared by every aggregate.
///
/// Aggregates embed one of these and expose it through [`Aggregate::meta`].
#[derive(Debug, Clone, Default)]
pub struct AggregateMeta {
    id: Option<AggregateId>,
    version: Version,
    pending: Vec<DomainEvent>,
}

impl AggregateMeta {
    /// Metadata for an aggregate that has never been persisted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata for an aggregate loaded from storage.
    pub fn restore(id: AggregateId, version: Version) -> Self {
        Self {
            id: Some(id),
            version,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> Option<AggregateId> {
        self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.pending
    }

    /// Queues an event for publication on the next commit.
    pub fn emit(&mut self, event: DomainEvent) {
        self.pending.push(event);
    }

    /// Removes and returns all pending events in the order they were queued.
    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Advances the version by one and returns the new value.
    pub fn advance_version(&mut self) -> Version {
        self.version = self.version.next();
        self.version
    }

    /// Assigns `id` unless the aggregate already has one; returns the identity in effect.
    pub fn assign_id(&mut self, id: AggregateId) -> AggregateId {
        *self.id.get_or_insert(id)
    }
}

/// A consistency boundary tracked by the unit of work.
///
/// Domain code mutates aggregates only through their own methods, which may
/// queue events. The version is advanced exclusively by the unit of work
/// commit protocol; identities are assigned by storage.
pub trait Aggregate: Send + Sync + 'static {
    /// Returns the aggregate type name used in logs and storage errors.
    fn aggregate_type() -> &'static str
    where
        Self: Sized;

    fn meta(&self) -> &AggregateMeta;

    fn meta_mut(&mut self) -> &mut AggregateMeta;

    /// Returns the aggregate's identity, or `None` before it is first persisted.
    fn id(&self) -> Option<AggregateId> {
        self.meta().id()
    }

    fn version(&self) -> Version {
        self.meta().version()
    }

    fn pending_events(&self) -> &[DomainEvent] {
        self.meta().pending_events()
    }

    /// Drains the pending-event queue. Called by the unit of work on commit.
    fn take_events(&mut self) -> Vec<DomainEvent> {
        self.meta_mut().take_events()
    }

    /// Advances the version by one. Called by the unit of work on commit.
    fn advance_version(&mut self) -> Version {
        self.meta_mut().advance_version()
    }

    /// Assigns an identity on first persist. Called by storage.
    fn assign_id(&mut self, id: AggregateId) -> AggregateId {
        self.meta_mut().assign_id(id)
    }
}
