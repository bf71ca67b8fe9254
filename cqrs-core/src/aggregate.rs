//! The aggregate lifecycle (C5): identity/version state, the change buffer,
//! apply-vs-replay, history hydration, validation, and soft delete.
//!
//! Stamping a new event and buffering it for persistence are kept as two
//! distinct operations rather than one, so a caller replaying history can't
//! accidentally re-buffer an already-stored event:
//! [`AggregateRoot::apply_new`] stamps and buffers, [`AggregateRoot::replay`]
//! only stamps.
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, ErrorCode, Result};
use crate::event::{Event, EventMessage, EventMessageOptions};

/// Uniquely identifies an aggregate instance.
pub trait AggregateId:
    Eq + std::hash::Hash + Clone + Send + Sync + ToString + Debug + std::fmt::Display + 'static
{
    /// Creates a new, unique aggregate id.
    fn new() -> Self;
}

impl AggregateId for Uuid {
    fn new() -> Self {
        Uuid::new_v4()
    }
}

impl AggregateId for String {
    fn new() -> Self {
        Uuid::new_v4().to_string()
    }
}

/// A marker trait for snapshots.
pub trait Snapshot: serde::Serialize + serde::de::DeserializeOwned + Clone + Debug + Send + Sync {}

/// The identity/version state, change buffer, and lifecycle flags shared by
/// every aggregate. Aggregate implementations embed one of these and expose
/// it via [`Aggregate::root`] / [`Aggregate::root_mut`].
#[derive(Debug, Clone)]
pub struct AggregateRoot<Id: AggregateId, E: Event> {
    id: Id,
    aggregate_type: &'static str,
    original_version: i64,
    current_version: i64,
    changes: Vec<EventMessage<E>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted: bool,
}

impl<Id: AggregateId, E: Event> AggregateRoot<Id, E> {
    /// Creates a fresh root for a brand-new aggregate instance (version 0).
    #[must_use]
    pub fn new(id: Id, aggregate_type: &'static str) -> Self {
        let now = Utc::now();
        Self {
            id,
            aggregate_type,
            original_version: 0,
            current_version: 0,
            changes: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }

    /// The aggregate's identity.
    #[must_use]
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The aggregate's type name.
    #[must_use]
    pub fn aggregate_type(&self) -> &'static str {
        self.aggregate_type
    }

    /// The version at load time (0 for a brand-new aggregate).
    #[must_use]
    pub fn original_version(&self) -> i64 {
        self.original_version
    }

    /// The current version, always `>= original_version`.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.current_version
    }

    /// Sets the original version. Repositories call this exactly once,
    /// right after hydration, with `v` equal to the aggregate's current
    /// version at that point.
    pub fn set_original_version(&mut self, v: i64) {
        self.original_version = v;
        self.current_version = v;
    }

    /// The buffered, not-yet-persisted events produced by [`apply_new`][Self::apply_new].
    #[must_use]
    pub fn changes(&self) -> &[EventMessage<E>] {
        &self.changes
    }

    /// Drains the change buffer. Repositories call this only after the
    /// changes have been durably appended.
    pub fn clear_changes(&mut self) {
        self.changes.clear();
    }

    /// Whether this aggregate has been soft-deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Marks this aggregate as soft-deleted.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.touch();
    }

    /// The timestamp this aggregate was first created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The timestamp this aggregate was last mutated.
    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Requires a non-empty id and type.
    pub fn validate(&self) -> Result<()> {
        if self.id.to_string().is_empty() || self.aggregate_type.is_empty() {
            return Err(Error::new(
                ErrorCode::InvalidAggregate,
                "aggregate id and type must be non-empty",
            ));
        }
        Ok(())
    }

    /// Stamps a brand-new event (id/type/`version = current + 1`/now) and
    /// appends it to the change buffer. Returns the stamped envelope.
    pub fn apply_new(&mut self, payload: E) -> &EventMessage<E> {
        let next_version = self.current_version + 1;
        let now = Utc::now();
        let mut event = EventMessage::new(payload, EventMessageOptions::default());
        event.stamp(self.id.to_string(), self.aggregate_type, next_version, now);

        self.current_version = next_version;
        self.updated_at = now;
        self.changes.push(event);
        self.changes.last().expect("just pushed")
    }

    /// Re-applies a historical event: advances `current_version` to the
    /// event's stamped version, without buffering it as a change.
    pub fn replay(&mut self, event: &EventMessage<E>) {
        self.current_version = event.version();
        self.updated_at = event.timestamp();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// An aggregate is a consistency boundary: an entity plus its invariants,
/// identified by `(type, id)`.
#[async_trait]
pub trait Aggregate: Default + Send + Sync + 'static {
    /// The type of the aggregate's unique identifier.
    type Id: AggregateId;
    /// The type of event payloads this aggregate produces.
    type Event: Event;
    /// The type of commands this aggregate can handle.
    type Command: Debug + Send + Sync;
    /// The type of snapshot this aggregate can produce.
    type Snapshot: Snapshot;
    /// The type of error this aggregate's command handling can produce.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The aggregate's static type name, used to key stores.
    const AGGREGATE_TYPE: &'static str;

    /// Returns the shared identity/version/change-buffer state.
    fn root(&self) -> &AggregateRoot<Self::Id, Self::Event>;

    /// Returns the shared identity/version/change-buffer state, mutably.
    fn root_mut(&mut self) -> &mut AggregateRoot<Self::Id, Self::Event>;

    /// Mutates the aggregate's domain state in response to a payload.
    /// Called by both [`apply`][Self::apply] (new events) and
    /// [`replay`][Self::replay] (historical events) — it must be a pure
    /// function of the payload, with no side effects of its own.
    fn mutate(&mut self, payload: &Self::Event);

    /// Handles a command and returns the events it produces. Must not
    /// mutate `self`; state changes only happen via [`apply`][Self::apply].
    async fn handle(
        &self,
        command: Self::Command,
    ) -> std::result::Result<Vec<Self::Event>, Self::Error>;

    /// Restores the aggregate's state from a snapshot.
    fn from_snapshot(id: Self::Id, snapshot: Self::Snapshot) -> Self;

    /// Creates a snapshot of the aggregate's current state.
    fn snapshot(&self) -> Self::Snapshot;

    /// The aggregate's identity.
    fn id(&self) -> &Self::Id {
        self.root().id()
    }

    /// The current version.
    fn version(&self) -> i64 {
        self.root().version()
    }

    /// The version at load time.
    fn original_version(&self) -> i64 {
        self.root().original_version()
    }

    /// Sets the original version; see [`AggregateRoot::set_original_version`].
    fn set_original_version(&mut self, v: i64) {
        self.root_mut().set_original_version(v);
    }

    /// The buffered, not-yet-persisted events.
    fn changes(&self) -> &[EventMessage<Self::Event>] {
        self.root().changes()
    }

    /// Drains the change buffer.
    fn clear_changes(&mut self) {
        self.root_mut().clear_changes();
    }

    /// Whether this aggregate has been soft-deleted.
    fn is_deleted(&self) -> bool {
        self.root().is_deleted()
    }

    /// Marks this aggregate as soft-deleted.
    fn mark_deleted(&mut self) {
        self.root_mut().mark_deleted();
    }

    /// Requires a non-empty id and type.
    fn validate(&self) -> Result<()> {
        self.root().validate()
    }

    /// Applies a brand-new event produced by domain logic: mutates state,
    /// then stamps and buffers the event. This is the only path that
    /// appends to the change buffer.
    fn apply(&mut self, payload: Self::Event) {
        self.mutate(&payload);
        self.root_mut().apply_new(payload);
    }

    /// Re-applies a historical event: mutates state and advances the
    /// version, without buffering. Used by history/snapshot hydration.
    fn replay(&mut self, event: &EventMessage<Self::Event>) {
        self.mutate(event.payload());
        self.root_mut().replay(event);
    }

    /// Restores the aggregate's state from a sequence of historical events,
    /// in order. On any failure (none of the provided default operations
    /// fail, but implementations of `mutate` may panic on invariant
    /// violations) the aggregate is left in its last-successful state.
    fn load_from_history<I: IntoIterator<Item = EventMessage<Self::Event>> + Send>(
        id: Self::Id,
        events: I,
    ) -> Self {
        let mut aggregate = Self::default();
        *aggregate.root_mut() = AggregateRoot::new(id, Self::AGGREGATE_TYPE);
        for event in events {
            aggregate.replay(&event);
        }
        aggregate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    enum CounterEvent {
        Incremented,
        Reset,
    }

    impl Event for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::Incremented => "Incremented",
                Self::Reset => "Reset",
            }
        }
        fn event_version(&self) -> u16 {
            1
        }
        fn event_source(&self) -> &'static str {
            "urn:cqrs-core:test"
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct CounterSnapshot {
        value: i64,
    }
    impl Snapshot for CounterSnapshot {}

    #[derive(Debug, Default)]
    struct Counter {
        root: Option<AggregateRoot<Uuid, CounterEvent>>,
        value: i64,
    }

    impl Counter {
        fn root_or_init(&self) -> &AggregateRoot<Uuid, CounterEvent> {
            self.root.as_ref().expect("root initialized")
        }
    }

    #[async_trait]
    impl Aggregate for Counter {
        type Id = Uuid;
        type Event = CounterEvent;
        type Command = ();
        type Snapshot = CounterSnapshot;
        type Error = std::convert::Infallible;

        const AGGREGATE_TYPE: &'static str = "Counter";

        fn root(&self) -> &AggregateRoot<Self::Id, Self::Event> {
            self.root_or_init()
        }

        fn root_mut(&mut self) -> &mut AggregateRoot<Self::Id, Self::Event> {
            self.root
                .get_or_insert_with(|| AggregateRoot::new(Uuid::new_v4(), Self::AGGREGATE_TYPE))
        }

        fn mutate(&mut self, payload: &Self::Event) {
            match payload {
                CounterEvent::Incremented => self.value += 1,
                CounterEvent::Reset => self.value = 0,
            }
        }

        async fn handle(
            &self,
            _command: Self::Command,
        ) -> std::result::Result<Vec<Self::Event>, Self::Error> {
            Ok(vec![CounterEvent::Incremented])
        }

        fn from_snapshot(id: Self::Id, snapshot: Self::Snapshot) -> Self {
            let mut root = AggregateRoot::new(id, Self::AGGREGATE_TYPE);
            root.set_original_version(0);
            Self {
                root: Some(root),
                value: snapshot.value,
            }
        }

        fn snapshot(&self) -> Self::Snapshot {
            CounterSnapshot { value: self.value }
        }
    }

    #[test]
    fn apply_stamps_and_buffers_exactly_one_change() {
        let mut agg = Counter::default();
        agg.apply(CounterEvent::Incremented);

        assert_eq!(agg.version(), 1);
        assert_eq!(agg.changes().len(), 1);
        assert_eq!(agg.changes()[0].version(), 1);
        assert_eq!(agg.value, 1);
    }

    #[test]
    fn replay_does_not_buffer() {
        let mut agg = Counter::default();
        agg.apply(CounterEvent::Incremented);
        let event = agg.changes()[0].clone();
        agg.clear_changes();

        let mut fresh = Counter::default();
        fresh.replay(&event);

        assert_eq!(fresh.version(), 1);
        assert!(fresh.changes().is_empty());
        assert_eq!(fresh.value, 1);
    }

    #[test]
    fn load_from_history_reproduces_state() {
        let mut agg = Counter::default();
        agg.apply(CounterEvent::Incremented);
        agg.apply(CounterEvent::Incremented);
        agg.apply(CounterEvent::Incremented);
        let events: Vec<_> = agg.changes().to_vec();

        let id = *agg.id();
        let replayed = Counter::load_from_history(id, events);
        assert_eq!(replayed.version(), 3);
        assert_eq!(replayed.value, 3);
        assert!(replayed.changes().is_empty());
    }

    #[test]
    fn validate_rejects_empty_type() {
        let root: AggregateRoot<Uuid, CounterEvent> = AggregateRoot::new(Uuid::nil(), "");
        assert!(root.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_id() {
        let root: AggregateRoot<String, CounterEvent> =
            AggregateRoot::new(String::new(), "Counter");
        assert!(root.validate().is_err());
    }
}
