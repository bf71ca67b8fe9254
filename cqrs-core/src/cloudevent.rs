//! CloudEvent conversion utilities.
//!
//! This module provides a lightweight [`CloudEvent`] newtype that wraps a
//! [`cloudevents::Event`] and blanket conversions from both a raw
//! [`Event`] payload and a stamped [`EventMessage`].
//!
//! # Example
//!
//! ```rust
//! use cqrs_core::cloudevent::CloudEvent;
//! use cqrs_core::event::Event;
//! use serde::{Serialize, Deserialize};
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct MyEvent;
//! impl Event for MyEvent {
//!     fn event_type(&self) -> &'static str { "MyEvent" }
//!     fn event_version(&self) -> u16 { 1 }
//!     fn event_source(&self) -> &'static str { "urn:cqrs-core:test" }
//! }
//! let ce: CloudEvent = MyEvent.into();
//! ```
//!
//! A random UUID is generated for the CloudEvent `id` field unless an
//! [`EventMessage`] is converted, in which case its own `event_id` is used.
//! The `source` attribute defaults to `"urn:cqrs-core:event"` if
//! [`Event::event_source`] is not a valid URI.
use crate::error::{Error, Result};
use crate::event::{Event, EventMessage};
use cloudevents::event::{Data, Event as CeEvent, EventBuilder, EventBuilderV10};
use cloudevents::AttributesReader;
use serde::Serialize;
use tracing::instrument;
use url::Url;
use uuid::Uuid;

const DEFAULT_SOURCE: &str = "urn:cqrs-core:event";

/// Newtype wrapper around [`cloudevents::Event`] so we can legally provide
/// blanket `From` implementations without violating Rust's orphan rules.
#[derive(Debug, Clone)]
pub struct CloudEvent(pub CeEvent);

impl CloudEvent {
    /// Returns the inner [`cloudevents::Event`].
    #[must_use]
    pub fn into_inner(self) -> CeEvent {
        self.0
    }

    /// Builds a [`CloudEvent`] from a payload, an explicit id, and an
    /// explicit [`Url`] source.
    #[instrument(skip(event))]
    pub fn from_event_with_source<E>(event: &E, id: String, source: Url) -> Result<Self>
    where
        E: Event + Serialize,
    {
        let data_json =
            serde_json::to_vec(event).map_err(|e| Error::serialization(e.to_string()))?;

        let ce = EventBuilderV10::new()
            .id(id)
            .ty(event.event_type())
            .source(source)
            .data("application/json", Data::from(data_json))
            .build()
            .map_err(|e| Error::serialization(format!("failed to build CloudEvent: {e}")))?;

        Ok(Self(ce))
    }

    /// Builds a [`CloudEvent`] from a stamped [`EventMessage`], carrying its
    /// `event_id` and tagging the aggregate id/type/version as extension
    /// attributes.
    pub fn from_message<P>(message: &EventMessage<P>) -> Result<Self>
    where
        P: Event + Serialize,
    {
        let source = event_source_url(message.payload());
        let data_json =
            serde_json::to_vec(message.payload()).map_err(|e| Error::serialization(e.to_string()))?;

        let ce = EventBuilderV10::new()
            .id(message.event_id().to_string())
            .ty(message.payload().event_type())
            .source(source)
            .data("application/json", Data::from(data_json))
            .extension("aggregateid", message.aggregate_id())
            .extension("aggregatetype", message.aggregate_type())
            .extension("aggregateversion", message.version().to_string())
            .build()
            .map_err(|e| Error::serialization(format!("failed to build CloudEvent: {e}")))?;
        Ok(Self(ce))
    }
}

fn event_source_url(event: &impl Event) -> Url {
    Url::parse(event.event_source()).unwrap_or_else(|_| Url::parse(DEFAULT_SOURCE).expect("default URN is valid"))
}

impl<E> From<E> for CloudEvent
where
    E: Event + Serialize,
{
    fn from(event: E) -> Self {
        let source = event_source_url(&event);
        let id = Uuid::new_v4().to_string();
        Self::from_event_with_source(&event, id, source).expect("constructing CloudEvent cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMessageOptions;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Credited {
        amount: u64,
    }
    impl Event for Credited {
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
    fn raw_payload_conversion_uses_declared_source() {
        let ce: CloudEvent = Credited { amount: 5 }.into();
        assert_eq!(ce.0.ty(), "Credited");
        assert_eq!(ce.0.source().to_string(), "urn:cqrs-core:test");
    }

    #[test]
    fn invalid_source_falls_back_to_default() {
        struct Bad;
        impl Serialize for Bad {
            fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_unit()
            }
        }
        impl Clone for Bad {
            fn clone(&self) -> Self {
                Bad
            }
        }
        impl std::fmt::Debug for Bad {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("Bad")
            }
        }
        impl<'de> Deserialize<'de> for Bad {
            fn deserialize<D: serde::Deserializer<'de>>(_d: D) -> std::result::Result<Self, D::Error> {
                Ok(Bad)
            }
        }
        impl Event for Bad {
            fn event_type(&self) -> &'static str {
                "Bad"
            }
            fn event_version(&self) -> u16 {
                1
            }
            fn event_source(&self) -> &'static str {
                "not a url"
            }
        }
        let ce: CloudEvent = Bad.into();
        assert_eq!(ce.0.source().to_string(), DEFAULT_SOURCE);
    }

    #[test]
    fn message_conversion_carries_event_id_and_aggregate_extensions() {
        let message = EventMessage::new(
            Credited { amount: 7 },
            EventMessageOptions {
                aggregate_id: Some("a1".into()),
                aggregate_type: Some("Account".into()),
                version: Some(4),
                ..Default::default()
            },
        );
        let ce = CloudEvent::from_message(&message).unwrap();
        assert_eq!(ce.0.id(), message.event_id());
    }
}
