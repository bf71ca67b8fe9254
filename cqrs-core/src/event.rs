//! The event envelope (C2): an immutable, stamped record of one state
//! transition of an aggregate, plus the domain-event extension used by the
//! event bus and projections.
use std::collections::HashMap;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{checksum_fields, new_id, Error, ErrorCode, Result};

/// A marker trait for event payloads.
///
/// Payloads must be serializable, deserializable, clonable, and debuggable.
/// The `#[derive(Event)]` macro in `cqrs-core-derive` implements this
/// automatically for payload enums.
pub trait Event: Serialize + DeserializeOwned + Clone + Debug + Send + Sync {
    /// Returns a static string slice representing the type of the event.
    fn event_type(&self) -> &'static str;

    /// Returns the version of the event's schema (for upcasting).
    fn event_version(&self) -> u16;

    /// Returns the CloudEvents `source` URI associated with this event.
    fn event_source(&self) -> &'static str;
}

/// The principal responsible for producing a domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Issuer {
    /// A human end user.
    #[default]
    User,
    /// The system itself (e.g. a background job).
    System,
    /// An administrator acting on behalf of the system.
    Admin,
    /// Another service.
    Service,
    /// A scheduler (cron-like trigger).
    Scheduler,
}

/// The broad category a domain event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EventCategory {
    /// Produced directly by a user action.
    UserAction,
    /// Produced by internal system processes.
    System,
    /// Produced by an integration with an external system.
    Integration,
    /// A plain domain-state-transition event (the default).
    #[default]
    Domain,
}

/// The priority of a domain event, used by the event bus to prioritize
/// delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// Low priority; may be delivered after other pending events.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// High priority.
    High,
    /// Must be delivered as soon as possible.
    Critical,
}

/// Options accepted when constructing an [`EventMessage`]; any field left as
/// `None` keeps the envelope's default (empty/zero) value, to be stamped
/// later by the aggregate on [`crate::aggregate::AggregateRoot::apply_new`].
#[derive(Debug, Clone, Default)]
pub struct EventMessageOptions {
    /// Overrides the event id (defaults to a fresh UUID).
    pub event_id: Option<String>,
    /// Presets the owning aggregate id.
    pub aggregate_id: Option<String>,
    /// Presets the owning aggregate type.
    pub aggregate_type: Option<String>,
    /// Presets the aggregate version this event represents.
    pub version: Option<i64>,
    /// Presets free-form metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Presets the timestamp (defaults to now).
    pub timestamp: Option<DateTime<Utc>>,
}

/// The event envelope: an immutable, stamped record of one state transition
/// of an aggregate. The payload itself is opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "P: Serialize",
    deserialize = "P: serde::de::DeserializeOwned"
))]
pub struct EventMessage<P: Event> {
    event_id: String,
    event_type: String,
    aggregate_id: String,
    aggregate_type: String,
    version: i64,
    payload: P,
    metadata: HashMap<String, serde_json::Value>,
    timestamp: DateTime<Utc>,
}

impl<P: Event> EventMessage<P> {
    /// Constructs a new envelope. Aggregate fields default to empty/zero
    /// and are stamped by the aggregate on [`apply_new`][crate::aggregate::AggregateRoot::apply_new]
    /// unless preset via `opts`.
    pub fn new(payload: P, opts: EventMessageOptions) -> Self {
        let event_type = payload.event_type().to_string();
        Self {
            event_id: opts.event_id.unwrap_or_else(new_id),
            event_type,
            aggregate_id: opts.aggregate_id.unwrap_or_default(),
            aggregate_type: opts.aggregate_type.unwrap_or_default(),
            version: opts.version.unwrap_or(0),
            payload,
            metadata: opts.metadata,
            timestamp: opts.timestamp.unwrap_or_else(Utc::now),
        }
    }

    /// The opaque, unique event id.
    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// The event's type string, matching `payload.event_type()` at
    /// construction time.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The id of the aggregate this event belongs to.
    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// The type of the aggregate this event belongs to.
    #[must_use]
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// The version of the aggregate after this event was applied.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The event payload.
    #[must_use]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Consumes the envelope, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> P {
        self.payload
    }

    /// The free-form metadata map.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    /// The timestamp this event was stamped at.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Stamps the aggregate id/type/version/timestamp in place. Used by
    /// [`crate::aggregate::AggregateRoot::apply_new`] and by stores
    /// rehydrating a persisted record.
    pub(crate) fn stamp(
        &mut self,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        version: i64,
        timestamp: DateTime<Utc>,
    ) {
        self.aggregate_id = aggregate_id.into();
        self.aggregate_type = aggregate_type.into();
        self.version = version;
        self.timestamp = timestamp;
    }

    /// Produces a deep-enough clone (metadata map copied) with selected
    /// overrides applied.
    #[must_use]
    pub fn clone_with_overrides(&self, overrides: EventMessageOptions) -> Self {
        let mut clone = self.clone();
        if let Some(id) = overrides.event_id {
            clone.event_id = id;
        }
        if let Some(aid) = overrides.aggregate_id {
            clone.aggregate_id = aid;
        }
        if let Some(atype) = overrides.aggregate_type {
            clone.aggregate_type = atype;
        }
        if let Some(v) = overrides.version {
            clone.version = v;
        }
        if !overrides.metadata.is_empty() {
            clone.metadata.extend(overrides.metadata);
        }
        if let Some(ts) = overrides.timestamp {
            clone.timestamp = ts;
        }
        clone
    }

    /// Requires id/type/aggregate-id to be non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.event_id.is_empty() || self.event_type.is_empty() || self.aggregate_id.is_empty()
        {
            return Err(Error::new(
                ErrorCode::EventValidation,
                "event id, type, and aggregate id must be non-empty",
            ));
        }
        Ok(())
    }

    /// The hex SHA-256 checksum over the canonical tuple
    /// `(id, type, aggregate_id, version, payload)`.
    pub fn checksum(&self) -> Result<String>
    where
        P: Serialize,
    {
        let payload_json = serde_json::to_string(&self.payload)
            .map_err(|e| Error::serialization(e.to_string()))?;
        Ok(checksum_fields(&[
            &self.event_id,
            &self.event_type,
            &self.aggregate_id,
            &self.version.to_string(),
            &payload_json,
        ]))
    }
}

/// Options accepted when constructing a [`DomainEventMessage`], layered on
/// top of [`EventMessageOptions`].
#[derive(Debug, Clone, Default)]
pub struct DomainEventOptions {
    /// The base envelope options.
    pub envelope: EventMessageOptions,
    /// Presets the issuer id (defaults to empty).
    pub issuer_id: Option<String>,
    /// Presets the issuer type (defaults to [`Issuer::User`]).
    pub issuer_type: Option<Issuer>,
    /// Presets the id of the command that produced this event.
    pub causation_id: Option<String>,
    /// Presets the correlation id shared across a request's events.
    pub correlation_id: Option<String>,
    /// Presets the event category (defaults to [`EventCategory::Domain`]).
    pub category: Option<EventCategory>,
    /// Presets the event priority (defaults to [`EventPriority::Normal`]).
    pub priority: Option<EventPriority>,
}

/// The domain-event extension of [`EventMessage`], adding issuer/causation/
/// correlation/category/priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "P: Serialize",
    deserialize = "P: serde::de::DeserializeOwned"
))]
pub struct DomainEventMessage<P: Event> {
    #[serde(flatten)]
    envelope: EventMessage<P>,
    issuer_id: String,
    issuer_type: Issuer,
    causation_id: Option<String>,
    correlation_id: Option<String>,
    category: EventCategory,
    priority: EventPriority,
}

impl<P: Event> DomainEventMessage<P> {
    /// Constructs a new domain event message, layering issuer/causation/
    /// correlation/category/priority on top of the base envelope.
    pub fn new(payload: P, opts: DomainEventOptions) -> Self {
        Self {
            envelope: EventMessage::new(payload, opts.envelope),
            issuer_id: opts.issuer_id.unwrap_or_default(),
            issuer_type: opts.issuer_type.unwrap_or_default(),
            causation_id: opts.causation_id,
            correlation_id: opts.correlation_id,
            category: opts.category.unwrap_or_default(),
            priority: opts.priority.unwrap_or_default(),
        }
    }

    /// The underlying envelope.
    #[must_use]
    pub fn envelope(&self) -> &EventMessage<P> {
        &self.envelope
    }

    /// Consumes this domain event, returning the underlying envelope.
    #[must_use]
    pub fn into_envelope(self) -> EventMessage<P> {
        self.envelope
    }

    /// The id of the principal that produced this event.
    #[must_use]
    pub fn issuer_id(&self) -> &str {
        &self.issuer_id
    }

    /// The kind of principal that produced this event.
    #[must_use]
    pub fn issuer_type(&self) -> Issuer {
        self.issuer_type
    }

    /// The id of the command that produced this event, if any.
    #[must_use]
    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    /// The correlation id shared across a request's events, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The event's category.
    #[must_use]
    pub fn category(&self) -> EventCategory {
        self.category
    }

    /// The event's priority.
    #[must_use]
    pub fn priority(&self) -> EventPriority {
        self.priority
    }

    /// Validates the underlying envelope.
    pub fn validate(&self) -> Result<()> {
        self.envelope.validate()
    }
}

impl<P: Event> std::ops::Deref for DomainEventMessage<P> {
    type Target = EventMessage<P>;

    fn deref(&self) -> &Self::Target {
        &self.envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Payload {
        amount: u64,
    }

    impl Event for Payload {
        fn event_type(&self) -> &'static str {
            "Credited"
        }
        fn event_version(&self) -> u16 {
            1
        }
        fn event_source(&self) -> &'static str {
            "urn:cqrs-core:test"
        }
    }

    #[test]
    fn validate_requires_non_empty_ids() {
        let event = EventMessage::new(Payload { amount: 1 }, EventMessageOptions::default());
        assert!(event.validate().is_err());

        let event = EventMessage::new(
            Payload { amount: 1 },
            EventMessageOptions {
                aggregate_id: Some("a1".into()),
                ..Default::default()
            },
        );
        assert!(event.validate().is_ok());
    }

    #[test]
    fn checksum_is_stable_for_same_fields() {
        let event = EventMessage::new(
            Payload { amount: 1 },
            EventMessageOptions {
                event_id: Some("e1".into()),
                aggregate_id: Some("a1".into()),
                version: Some(1),
                ..Default::default()
            },
        );
        let c1 = event.checksum().unwrap();
        let c2 = event.checksum().unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn clone_with_overrides_preserves_unset_fields() {
        let event = EventMessage::new(
            Payload { amount: 1 },
            EventMessageOptions {
                aggregate_id: Some("a1".into()),
                version: Some(2),
                ..Default::default()
            },
        );
        let clone = event.clone_with_overrides(EventMessageOptions {
            version: Some(3),
            ..Default::default()
        });
        assert_eq!(clone.aggregate_id(), "a1");
        assert_eq!(clone.version(), 3);
        assert_eq!(clone.event_id(), event.event_id());
    }

    #[test]
    fn domain_event_defaults_match_spec() {
        let event = DomainEventMessage::new(Payload { amount: 1 }, DomainEventOptions::default());
        assert_eq!(event.category(), EventCategory::Domain);
        assert_eq!(event.priority(), EventPriority::Normal);
        assert_eq!(event.issuer_type(), Issuer::User);
    }
}
