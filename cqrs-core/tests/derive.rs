#![allow(missing_docs)]
use cqrs_core::event::Event;
use cqrs_core_derive::Event as DeriveEvent;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, DeriveEvent)]
#[event(version = 7, source = "urn:custom")]
enum CustomEvent {
    Something,
    #[event(version = 9, source = "urn:variant")]
    Else,
}

#[test]
fn derive_macro_configurable_version_and_source() {
    assert_eq!(CustomEvent::Something.event_version(), 7);
    assert_eq!(CustomEvent::Something.event_source(), "urn:custom");
    assert_eq!(CustomEvent::Something.event_type(), "Something");

    // Variant override
    assert_eq!(CustomEvent::Else.event_version(), 9);
    assert_eq!(CustomEvent::Else.event_source(), "urn:variant");
    assert_eq!(CustomEvent::Else.event_type(), "Else");
}
