//! JSON (de)serialization for the wire/stored shapes: the event envelope,
//! and the read-model record. Both delegate concrete-type reconstruction
//! to a registry (C3) or an injected factory.
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::{Event, EventMessage, EventMessageOptions};
use crate::registry::EventDataRegistry;
use crate::store::read_model_store::ReadModel;

/// The canonical stored-event JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    event_id: String,
    event_type: String,
    aggregate_id: String,
    aggregate_type: String,
    version: i64,
    event_data: serde_json::Value,
    metadata: HashMap<String, serde_json::Value>,
    timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// The event id.
    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// The event type string, used to route bus subscriptions and registry
    /// lookups.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The owning aggregate's id.
    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// The owning aggregate's type.
    #[must_use]
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// The aggregate version this event represents.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The opaque event payload, still JSON-encoded.
    #[must_use]
    pub fn event_data(&self) -> &serde_json::Value {
        &self.event_data
    }

    /// Free-form metadata.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    /// The stamped timestamp.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// The result of deserializing an event whose concrete payload type may or
/// may not be known to the registry.
#[derive(Debug)]
pub enum EventData {
    /// The registry recognised `event_type` and reconstructed a typed,
    /// boxed instance.
    Typed(Box<dyn Any + Send + Sync>),
    /// `event_type` was not registered; the decoded JSON value is passed
    /// through unchanged.
    Raw(serde_json::Value),
}

/// A deserialized event, with its envelope fields intact and its payload
/// resolved via [`EventData`].
#[derive(Debug)]
pub struct DecodedEvent {
    /// The event id.
    pub event_id: String,
    /// The event type string.
    pub event_type: String,
    /// The owning aggregate's id.
    pub aggregate_id: String,
    /// The owning aggregate's type.
    pub aggregate_type: String,
    /// The aggregate version this event represents.
    pub version: i64,
    /// The reconstructed (or raw) payload.
    pub event_data: EventData,
    /// Free-form metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// The stamped timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Serializes [`EventMessage`]s to the canonical JSON shape, and
/// deserializes that shape back, reconstructing `event_data` via an
/// [`EventDataRegistry`] when the type is known.
#[derive(Clone, Default)]
pub struct JsonEventSerializer {
    registry: Arc<EventDataRegistry>,
}

impl JsonEventSerializer {
    /// Creates a serializer backed by the given registry.
    #[must_use]
    pub fn new(registry: Arc<EventDataRegistry>) -> Self {
        Self { registry }
    }

    /// Reduces an envelope to the canonical [`EventRecord`] shape, without
    /// going to bytes. Used wherever a type-erased boundary is needed (the
    /// event bus, the dispatchers) without paying for a JSON round trip.
    pub fn to_record<P: Event>(&self, event: &EventMessage<P>) -> Result<EventRecord> {
        Ok(EventRecord {
            event_id: event.event_id().to_string(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            aggregate_type: event.aggregate_type().to_string(),
            version: event.version(),
            event_data: serde_json::to_value(event.payload())
                .map_err(|e| Error::serialization(e.to_string()))?,
            metadata: event.metadata().clone(),
            timestamp: event.timestamp(),
        })
    }

    /// Serializes an envelope to the canonical JSON shape.
    pub fn serialize<P: Event>(&self, event: &EventMessage<P>) -> Result<Vec<u8>> {
        let record = self.to_record(event)?;
        serde_json::to_vec(&record).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Deserializes the canonical JSON shape, reconstructing `event_data`
    /// via the registry when `event_type` is known, otherwise returning the
    /// raw decoded value.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<DecodedEvent> {
        let record: EventRecord =
            serde_json::from_slice(bytes).map_err(|e| Error::serialization(e.to_string()))?;

        let event_data = match self.registry.decode(&record.event_type, record.event_data.clone())
        {
            Some(Ok(typed)) => EventData::Typed(typed),
            Some(Err(err)) => return Err(err),
            None => EventData::Raw(record.event_data),
        };

        Ok(DecodedEvent {
            event_id: record.event_id,
            event_type: record.event_type,
            aggregate_id: record.aggregate_id,
            aggregate_type: record.aggregate_type,
            version: record.version,
            event_data,
            metadata: record.metadata,
            timestamp: record.timestamp,
        })
    }

    /// Rehydrates a strongly-typed [`EventMessage<P>`] directly, without
    /// going through the registry — used when the caller already knows the
    /// concrete payload type (the common case for a per-aggregate event
    /// store).
    pub fn deserialize_typed<P: Event>(&self, bytes: &[u8]) -> Result<EventMessage<P>> {
        let record: EventRecord =
            serde_json::from_slice(bytes).map_err(|e| Error::serialization(e.to_string()))?;
        let payload: P = serde_json::from_value(record.event_data)
            .map_err(|e| Error::serialization(e.to_string()))?;
        Ok(EventMessage::new(
            payload,
            EventMessageOptions {
                event_id: Some(record.event_id),
                aggregate_id: Some(record.aggregate_id),
                aggregate_type: Some(record.aggregate_type),
                version: Some(record.version),
                metadata: record.metadata,
                timestamp: Some(record.timestamp),
            },
        ))
    }
}

/// A factory that produces a correctly-typed read-model subtype from raw
/// JSON data, or `None` if it cannot handle the given model type.
pub type ReadModelFactory =
    Arc<dyn Fn(serde_json::Value) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// Serializes/deserializes [`ReadModel`]s to the canonical JSON shape
/// `{id, type, version, data, last_updated}`, using an injected factory per
/// model type to produce the correct subtype, falling back to the base
/// [`ReadModel`] when no factory is registered.
#[derive(Clone, Default)]
pub struct JsonReadModelSerializer {
    factories: Arc<DashMap<String, ReadModelFactory>>,
}

impl JsonReadModelSerializer {
    /// Creates an empty serializer (always falls back to the base
    /// [`ReadModel`] shape).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for `model_type`.
    pub fn register_factory(&self, model_type: impl Into<String>, factory: ReadModelFactory) {
        self.factories.insert(model_type.into(), factory);
    }

    /// Serializes a read model to the canonical JSON shape.
    pub fn serialize(&self, model: &ReadModel) -> Result<Vec<u8>> {
        serde_json::to_vec(model).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Deserializes the canonical JSON shape into a base [`ReadModel`].
    pub fn deserialize(&self, bytes: &[u8]) -> Result<ReadModel> {
        serde_json::from_slice(bytes).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Deserializes and, if a factory is registered for the model's type,
    /// also produces the concrete subtype. Falls back to `None` for the
    /// subtype when unregistered.
    pub fn deserialize_subtype(
        &self,
        bytes: &[u8],
    ) -> Result<(ReadModel, Option<Box<dyn Any + Send + Sync>>)> {
        let model = self.deserialize(bytes)?;
        let subtype = match self.factories.get(&model.model_type) {
            Some(factory) => Some(factory(model.data.clone())?),
            None => None,
        };
        Ok((model, subtype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize as _;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
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
    fn round_trip_preserves_envelope_fields_and_typed_payload() {
        let registry = Arc::new(EventDataRegistry::new());
        registry.register("Credited", Payload::default()).unwrap();
        let serializer = JsonEventSerializer::new(registry);

        let event = EventMessage::new(
            Payload { amount: 42 },
            EventMessageOptions {
                aggregate_id: Some("a1".into()),
                aggregate_type: Some("Account".into()),
                version: Some(3),
                ..Default::default()
            },
        );

        let bytes = serializer.serialize(&event).unwrap();
        let decoded = serializer.deserialize(&bytes).unwrap();

        assert_eq!(decoded.aggregate_id, "a1");
        assert_eq!(decoded.aggregate_type, "Account");
        assert_eq!(decoded.version, 3);
        match decoded.event_data {
            EventData::Typed(boxed) => {
                assert_eq!(*boxed.downcast::<Payload>().unwrap(), Payload { amount: 42 });
            }
            EventData::Raw(_) => panic!("expected typed payload"),
        }
    }

    #[test]
    fn unknown_type_falls_back_to_raw_value() {
        let registry = Arc::new(EventDataRegistry::new());
        let serializer = JsonEventSerializer::new(registry);

        let event = EventMessage::new(
            Payload { amount: 42 },
            EventMessageOptions {
                aggregate_id: Some("a1".into()),
                ..Default::default()
            },
        );
        let bytes = serializer.serialize(&event).unwrap();
        let decoded = serializer.deserialize(&bytes).unwrap();
        match decoded.event_data {
            EventData::Raw(value) => assert_eq!(value["amount"], 42),
            EventData::Typed(_) => panic!("expected raw fallback"),
        }
    }

    #[test]
    fn read_model_serializer_falls_back_to_base_without_factory() {
        let serializer = JsonReadModelSerializer::new();
        let model = ReadModel::new("r1", "Account", serde_json::json!({"balance": 10}));
        let bytes = serializer.serialize(&model).unwrap();
        let (decoded, subtype) = serializer.deserialize_subtype(&bytes).unwrap();
        assert_eq!(decoded.id, "r1");
        assert!(subtype.is_none());
    }
}
