//! The event-data registry (C3): maps `event_type -> concrete payload type`
//! so that a dynamic-dispatch deserializer (the JSON event serializer, the
//! event bus, and projections, all of which only see a type string at
//! runtime) can reconstruct a typed payload.
//!
//! This reflection-style registry is kept at the serialization boundary
//! only. Statically-typed aggregate code (`Aggregate::Event`, an ordinary
//! Rust enum) never goes through it.
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, ErrorCode, Result};

type FactoryFn = Arc<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(serde_json::Value) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;
type EncodeFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<serde_json::Value> + Send + Sync>;

/// A thread-safe registry mapping event-type strings to concrete payload
/// types, used to reconstruct typed instances during deserialization.
#[derive(Default)]
pub struct EventDataRegistry {
    factories: DashMap<String, FactoryFn>,
    decoders: DashMap<String, DecodeFn>,
    encoders: DashMap<String, EncodeFn>,
}

impl EventDataRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a payload type under `event_type`, using `zero_value` only
    /// to validate that the type round-trips through JSON (the value itself
    /// is discarded; [`create_instance`][Self::create_instance] always
    /// produces a fresh default).
    ///
    /// Rejects payloads that are not round-trippable through JSON (for
    /// example a type whose `Serialize`/`Deserialize` impls disagree on
    /// shape).
    pub fn register<T>(&self, event_type: impl Into<String>, zero_value: T) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Default + Debug + Send + Sync + Clone + 'static,
    {
        let event_type = event_type.into();
        let json = serde_json::to_value(&zero_value).map_err(|e| {
            Error::new(
                ErrorCode::EventValidation,
                format!("event type {event_type} payload does not serialize to JSON: {e}"),
            )
        })?;
        let _: T = serde_json::from_value(json).map_err(|e| {
            Error::new(
                ErrorCode::EventValidation,
                format!("event type {event_type} payload is not JSON round-trippable: {e}"),
            )
        })?;

        self.factories.insert(
            event_type.clone(),
            Arc::new(|| Box::new(T::default()) as Box<dyn Any + Send + Sync>),
        );
        self.decoders.insert(
            event_type.clone(),
            Arc::new(|value| {
                let typed: T = serde_json::from_value(value)
                    .map_err(|e| Error::serialization(e.to_string()))?;
                Ok(Box::new(typed) as Box<dyn Any + Send + Sync>)
            }),
        );
        self.encoders.insert(
            event_type,
            Arc::new(|any| {
                let typed = any
                    .downcast_ref::<T>()
                    .ok_or_else(|| Error::serialization("registry type mismatch on encode"))?;
                serde_json::to_value(typed).map_err(|e| Error::serialization(e.to_string()))
            }),
        );
        Ok(())
    }

    /// Whether a payload type is registered under `event_type`.
    #[must_use]
    pub fn is_registered(&self, event_type: &str) -> bool {
        self.factories.contains_key(event_type)
    }

    /// Returns a newly allocated, default-valued instance of the type
    /// registered under `event_type`, or `None` if unregistered.
    #[must_use]
    pub fn create_instance(&self, event_type: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.factories.get(event_type).map(|f| f())
    }

    /// Decodes `value` into the type registered under `event_type`. Returns
    /// `None` if the type is not registered — callers should fall back to
    /// the raw decoded JSON value in that case.
    pub fn decode(
        &self,
        event_type: &str,
        value: serde_json::Value,
    ) -> Option<Result<Box<dyn Any + Send + Sync>>> {
        self.decoders.get(event_type).map(|d| d(value))
    }

    /// Encodes a previously-decoded boxed value back to JSON, using the
    /// encoder registered under `event_type`.
    pub fn encode(
        &self,
        event_type: &str,
        value: &(dyn Any + Send + Sync),
    ) -> Option<Result<serde_json::Value>> {
        self.encoders.get(event_type).map(|e| e(value))
    }

    /// Removes the registration for `event_type`, if present.
    pub fn unregister(&self, event_type: &str) {
        self.factories.remove(event_type);
        self.decoders.remove(event_type);
        self.encoders.remove(event_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct Payload {
        amount: u64,
    }

    #[test]
    fn register_then_create_instance_round_trips() {
        let registry = EventDataRegistry::new();
        registry.register("Credited", Payload::default()).unwrap();

        assert!(registry.is_registered("Credited"));
        let instance = registry.create_instance("Credited").unwrap();
        assert_eq!(*instance.downcast::<Payload>().unwrap(), Payload::default());
    }

    #[test]
    fn decode_reconstructs_typed_pointer() {
        let registry = EventDataRegistry::new();
        registry.register("Credited", Payload::default()).unwrap();

        let value = serde_json::json!({ "amount": 42 });
        let decoded = registry.decode("Credited", value).unwrap().unwrap();
        let typed = decoded.downcast::<Payload>().unwrap();
        assert_eq!(typed.amount, 42);
    }

    #[test]
    fn unknown_type_returns_none() {
        let registry = EventDataRegistry::new();
        assert!(registry.decode("Unknown", serde_json::json!({})).is_none());
        assert!(registry.create_instance("Unknown").is_none());
    }

    #[test]
    fn unregister_removes_type() {
        let registry = EventDataRegistry::new();
        registry.register("Credited", Payload::default()).unwrap();
        registry.unregister("Credited");
        assert!(!registry.is_registered("Credited"));
    }
}
