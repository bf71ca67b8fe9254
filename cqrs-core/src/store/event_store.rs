//! The event store (C10): the append-only, per-aggregate event stream, with
//! optimistic-concurrency appends and upcast-aware raw loads.
use async_trait::async_trait;

use crate::aggregate::Aggregate;
use crate::event::EventMessage;
use crate::error::Result;
use crate::upcaster::RawStoredEvent;

/// Persists and loads an aggregate's event stream.
///
/// Implementations must make [`append`][Self::append] atomic: it must fail
/// with [`crate::error::ErrorCode::ConcurrencyConflict`] if `expected_version`
/// does not match the stream's current last version, rather than partially
/// applying the batch.
#[async_trait]
pub trait EventStore<A: Aggregate>: Send + Sync {
    /// Appends already-stamped events to the stream for `id`, failing if
    /// `expected_version` does not match the stream's current version.
    async fn append(
        &self,
        id: &A::Id,
        expected_version: i64,
        events: Vec<EventMessage<A::Event>>,
    ) -> Result<Vec<EventMessage<A::Event>>>;

    /// Loads the full event stream for `id`, in order.
    async fn load(&self, id: &A::Id) -> Result<Vec<EventMessage<A::Event>>>;

    /// Loads the event stream for `id` strictly after `version` — used to
    /// hydrate an aggregate from a snapshot.
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<EventMessage<A::Event>>>;

    /// Loads the raw (un-deserialized) event stream for `id` strictly after
    /// `version`, for upcasting prior to deserialization.
    async fn load_raw(&self, id: &A::Id, version: i64) -> Result<Vec<RawStoredEvent>>;

    /// The version of the last event appended for `id`, or `0` if none.
    async fn last_version(&self, id: &A::Id) -> Result<i64> {
        Ok(self.load(id).await?.last().map(EventMessage::version).unwrap_or(0))
    }

    /// Compacts the stream for `id`, discarding events strictly before
    /// `before_version`. An event whose version equals `before_version` is
    /// kept. Returns the number of events discarded.
    ///
    /// Implementations that do not support compaction may return `Ok(0)`
    /// unconditionally; callers should treat compaction purely as a storage
    /// optimization, never rely on it for correctness (a snapshot must
    /// exist covering the discarded range).
    async fn compact(&self, id: &A::Id, before_version: i64) -> Result<u64>;
}
