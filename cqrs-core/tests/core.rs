//! Integration tests exercising the event store, snapshot store, and
//! event-sourced repository together.
use std::sync::Arc;

use cqrs_core::aggregate::{Aggregate, AggregateRoot, Snapshot};
use cqrs_core::async_trait;
use cqrs_core::error::ErrorCode;
use cqrs_core::event::{Event, EventMessage};
use cqrs_core::repository::{EventSourcedRepository, Repository};
use cqrs_core::store::event_store::EventStore;
use cqrs_core::store::in_memory::InMemoryEventStore;
use cqrs_core::store::in_memory_snapshot::InMemorySnapshotStore;
use cqrs_core::store::snapshot_store::SnapshotStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
enum TestEvent {
    Created,
    Updated,
}

impl Event for TestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Updated => "Updated",
        }
    }
    fn event_version(&self) -> u16 {
        1
    }
    fn event_source(&self) -> &'static str {
        "urn:cqrs-core:test"
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TestSnapshot {
    version: i64,
    update_count: i64,
}
impl Snapshot for TestSnapshot {}

#[derive(Debug, Default)]
struct TestAggregate {
    root: Option<AggregateRoot<Uuid, TestEvent>>,
    update_count: i64,
}

impl TestAggregate {
    fn root_or_init(&mut self) -> &mut AggregateRoot<Uuid, TestEvent> {
        self.root.get_or_insert_with(|| AggregateRoot::new(Uuid::new_v4(), Self::AGGREGATE_TYPE))
    }
}

#[async_trait]
impl Aggregate for TestAggregate {
    type Id = Uuid;
    type Event = TestEvent;
    type Command = ();
    type Snapshot = TestSnapshot;
    type Error = std::convert::Infallible;
    const AGGREGATE_TYPE: &'static str = "TestAggregate";

    fn root(&self) -> &AggregateRoot<Self::Id, Self::Event> {
        self.root.as_ref().expect("root initialized before use")
    }
    fn root_mut(&mut self) -> &mut AggregateRoot<Self::Id, Self::Event> {
        self.root_or_init()
    }

    fn mutate(&mut self, event: &Self::Event) {
        if matches!(event, TestEvent::Updated) {
            self.update_count += 1;
        }
    }

    async fn handle(&self, _command: Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        Ok(Vec::new())
    }

    fn from_snapshot(id: Self::Id, snapshot: Self::Snapshot) -> Self {
        let mut aggregate = Self {
            root: Some(AggregateRoot::new(id, Self::AGGREGATE_TYPE)),
            update_count: snapshot.update_count,
        };
        aggregate.root_mut().set_original_version(snapshot.version);
        aggregate
    }

    fn snapshot(&self) -> Self::Snapshot {
        TestSnapshot {
            version: self.version(),
            update_count: self.update_count,
        }
    }
}

fn new_aggregate() -> TestAggregate {
    let mut aggregate = TestAggregate::default();
    aggregate.root_or_init();
    aggregate
}

fn stamped(payload: TestEvent, version: i64) -> EventMessage<TestEvent> {
    EventMessage::new(
        payload,
        cqrs_core::event::EventMessageOptions {
            version: Some(version),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn in_memory_event_store_append_and_load() {
    let store = InMemoryEventStore::<TestAggregate>::default();
    let id = Uuid::new_v4();

    let stored = store.append(&id, 0, vec![stamped(TestEvent::Created, 1)]).await.expect("append should succeed");
    assert_eq!(stored.len(), 1);

    let loaded = store.load(&id).await.expect("load should succeed");
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].event_type(), "Created");
    assert_eq!(loaded[0].version(), 1);
}

#[tokio::test]
async fn in_memory_event_store_rejects_version_conflict() {
    let store = InMemoryEventStore::<TestAggregate>::default();
    let id = Uuid::new_v4();
    store.append(&id, 0, vec![stamped(TestEvent::Created, 1)]).await.expect("initial append");

    let err = store
        .append(&id, 0, vec![stamped(TestEvent::Updated, 2)])
        .await
        .expect_err("should conflict");
    assert_eq!(err.code, ErrorCode::ConcurrencyConflict);
}

#[tokio::test]
async fn snapshot_store_save_and_load() {
    let snapshots = InMemorySnapshotStore::<TestAggregate>::default();
    let id = Uuid::new_v4();

    snapshots.save(&id, 1, TestSnapshot { version: 1 }).await.expect("save snapshot");

    let loaded = snapshots.load(&id).await.expect("load").expect("snapshot should exist");
    assert_eq!(loaded.version(), 1);
}

#[tokio::test]
async fn repository_save_and_load_hydrates_through_snapshot() {
    let event_store = Arc::new(InMemoryEventStore::<TestAggregate>::default());
    let snapshot_store = Arc::new(InMemorySnapshotStore::<TestAggregate>::default());
    let repo = EventSourcedRepository::new(event_store, Some(snapshot_store.clone())).with_snapshot_frequency(Some(1));

    let mut aggregate = new_aggregate();
    aggregate.apply(TestEvent::Created);
    aggregate.apply(TestEvent::Updated);
    repo.save(&mut aggregate).await.expect("save events");

    let id = *aggregate.id();
    let loaded = repo.get_by_id(&id).await.expect("load");
    assert_eq!(loaded.version(), 2);
    assert_eq!(loaded.update_count, 1);

    // Snapshot frequency of 1 means every version snapshots.
    let snapshot = snapshot_store.load(&id).await.expect("load snapshot").expect("snapshot exists");
    assert_eq!(snapshot.version(), 2);
}

#[tokio::test]
async fn repository_get_by_id_fails_for_unknown_aggregate() {
    let event_store = Arc::new(InMemoryEventStore::<TestAggregate>::default());
    let repo: EventSourcedRepository<TestAggregate, _, InMemorySnapshotStore<TestAggregate>> =
        EventSourcedRepository::new(event_store, None);

    let err = repo.get_by_id(&Uuid::new_v4()).await.expect_err("should not be found");
    assert_eq!(err.code, ErrorCode::AggregateNotFound);
}
