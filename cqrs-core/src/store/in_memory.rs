//! An in-memory event store, useful for testing and development (the
//! default backend, behind the `in-memory` feature).
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::instrument;

use crate::aggregate::Aggregate;
use crate::error::{Error, ErrorCode, Result};
use crate::event::EventMessage;
use crate::store::event_store::EventStore;
use crate::upcaster::RawStoredEvent;

type EventStream<E> = Vec<EventMessage<E>>;
type StoreMap<E> = DashMap<String, EventStream<E>>;

/// An in-memory, thread-safe event store.
pub struct InMemoryEventStore<A: Aggregate> {
    events: Arc<StoreMap<A::Event>>,
}

impl<A: Aggregate> Default for InMemoryEventStore<A> {
    fn default() -> Self {
        Self {
            events: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl<A> EventStore<A> for InMemoryEventStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self, events), fields(id = ?id, expected_version))]
    async fn append(
        &self,
        id: &A::Id,
        expected_version: i64,
        events: Vec<EventMessage<A::Event>>,
    ) -> Result<Vec<EventMessage<A::Event>>> {
        let aggregate_id = id.to_string();
        let mut stream = self.events.entry(aggregate_id).or_default();

        let current_version = stream.last().map(EventMessage::version).unwrap_or(0);
        if current_version != expected_version {
            return Err(Error::concurrency_conflict(format!(
                "expected version {expected_version}, found {current_version}"
            )));
        }

        stream.extend(events.iter().cloned());
        Ok(events)
    }

    #[instrument(skip(self), fields(id = ?id))]
    async fn load(&self, id: &A::Id) -> Result<Vec<EventMessage<A::Event>>> {
        let aggregate_id = id.to_string();
        Ok(self.events.get(&aggregate_id).map(|s| s.clone()).unwrap_or_default())
    }

    #[instrument(skip(self), fields(id = ?id, version))]
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<EventMessage<A::Event>>> {
        let aggregate_id = id.to_string();
        Ok(match self.events.get(&aggregate_id) {
            Some(stream) => stream.iter().filter(|e| e.version() > version).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn load_raw(&self, id: &A::Id, version: i64) -> Result<Vec<RawStoredEvent>> {
        let aggregate_id = id.to_string();
        match self.events.get(&aggregate_id) {
            Some(stream) => stream
                .iter()
                .filter(|e| e.version() > version)
                .map(|e| {
                    serde_json::to_value(e.payload())
                        .map_err(|se| Error::new(ErrorCode::EventStoreError, se.to_string()))
                        .map(|payload| RawStoredEvent {
                            aggregate_id: e.aggregate_id().to_string(),
                            version: e.version(),
                            event_version: e.payload().event_version(),
                            event_type: e.event_type().to_string(),
                            payload,
                        })
                })
                .collect::<Result<Vec<_>>>(),
            None => Ok(Vec::new()),
        }
    }

    async fn compact(&self, id: &A::Id, before_version: i64) -> Result<u64> {
        let aggregate_id = id.to_string();
        let Some(mut stream) = self.events.get_mut(&aggregate_id) else {
            return Ok(0);
        };
        let before = stream.len();
        stream.retain(|e| e.version() >= before_version);
        Ok((before - stream.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventMessageOptions};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    enum TestEvent {
        Incremented,
    }

    impl Event for TestEvent {
        fn event_type(&self) -> &'static str {
            "Incremented"
        }
        fn event_version(&self) -> u16 {
            1
        }
        fn event_source(&self) -> &'static str {
            "urn:cqrs-core:test"
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct EmptySnapshot;
    impl crate::aggregate::Snapshot for EmptySnapshot {}

    #[derive(Debug, Default)]
    struct Noop {
        root: Option<crate::aggregate::AggregateRoot<uuid::Uuid, TestEvent>>,
    }

    #[async_trait]
    impl Aggregate for Noop {
        type Id = uuid::Uuid;
        type Event = TestEvent;
        type Command = ();
        type Snapshot = EmptySnapshot;
        type Error = std::convert::Infallible;
        const AGGREGATE_TYPE: &'static str = "Noop";

        fn root(&self) -> &crate::aggregate::AggregateRoot<Self::Id, Self::Event> {
            self.root.as_ref().expect("root initialized")
        }
        fn root_mut(&mut self) -> &mut crate::aggregate::AggregateRoot<Self::Id, Self::Event> {
            self.root
                .get_or_insert_with(|| crate::aggregate::AggregateRoot::new(uuid::Uuid::new_v4(), Self::AGGREGATE_TYPE))
        }
        fn mutate(&mut self, _payload: &Self::Event) {}
        async fn handle(&self, _c: Self::Command) -> std::result::Result<Vec<Self::Event>, Self::Error> {
            Ok(vec![])
        }
        fn from_snapshot(_id: Self::Id, _s: Self::Snapshot) -> Self {
            Self::default()
        }
        fn snapshot(&self) -> Self::Snapshot {
            EmptySnapshot
        }
    }

    fn event(version: i64, aggregate_id: &str) -> EventMessage<TestEvent> {
        EventMessage::new(
            TestEvent::Incremented,
            EventMessageOptions {
                aggregate_id: Some(aggregate_id.into()),
                aggregate_type: Some("Noop".into()),
                version: Some(version),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let store = InMemoryEventStore::<Noop>::default();
        let id = uuid::Uuid::new_v4();
        store.append(&id, 0, vec![event(1, &id.to_string())]).await.unwrap();

        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(store.last_version(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn append_rejects_stale_expected_version() {
        let store = InMemoryEventStore::<Noop>::default();
        let id = uuid::Uuid::new_v4();
        store.append(&id, 0, vec![event(1, &id.to_string())]).await.unwrap();

        let err = store.append(&id, 0, vec![event(2, &id.to_string())]).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ConcurrencyConflict);
    }

    #[tokio::test]
    async fn compact_discards_events_strictly_before_version() {
        let store = InMemoryEventStore::<Noop>::default();
        let id = uuid::Uuid::new_v4();
        store
            .append(&id, 0, vec![event(1, &id.to_string()), event(2, &id.to_string())])
            .await
            .unwrap();

        let discarded = store.compact(&id, 2).await.unwrap();
        assert_eq!(discarded, 1);
        let remaining = store.load(&id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].version(), 2);
    }
}
