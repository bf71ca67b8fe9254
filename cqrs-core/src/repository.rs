//! Repositories (C14): the load/save orchestration that sits between a
//! command handler and the stores. Three strategies share one contract —
//! event-sourced, state-based, and hybrid — selected per aggregate type by
//! [`crate::storage_strategy::ConfigurableRepositoryFactory`].
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::aggregate::Aggregate;
use crate::error::{Error, ErrorCode, Result};
use crate::store::event_store::EventStore;
use crate::store::snapshot_store::SnapshotStore;
use crate::store::state_store::StateStore;
use crate::upcaster::UpcasterChain;

/// The common load/save contract every repository strategy implements.
#[async_trait]
pub trait Repository<A: Aggregate>: Send + Sync {
    /// Loads the current state of the aggregate identified by `id`.
    ///
    /// # Errors
    /// Returns [`ErrorCode::AggregateNotFound`] if no history/state exists.
    async fn get_by_id(&self, id: &A::Id) -> Result<A>;

    /// Persists `aggregate`'s buffered changes (or current state), then
    /// clears them and advances its original version.
    async fn save(&self, aggregate: &mut A) -> Result<()>;

    /// The latest persisted version for `id`, or `0` if none exists.
    async fn get_version(&self, id: &A::Id) -> Result<i64>;

    /// Whether any state/history exists for `id`.
    async fn exists(&self, id: &A::Id) -> Result<bool>;
}

#[async_trait]
impl<A, R> Repository<A> for Arc<R>
where
    A: Aggregate,
    R: Repository<A> + Send + Sync,
{
    async fn get_by_id(&self, id: &A::Id) -> Result<A> {
        (**self).get_by_id(id).await
    }
    async fn save(&self, aggregate: &mut A) -> Result<()> {
        (**self).save(aggregate).await
    }
    async fn get_version(&self, id: &A::Id) -> Result<i64> {
        (**self).get_version(id).await
    }
    async fn exists(&self, id: &A::Id) -> Result<bool> {
        (**self).exists(id).await
    }
}

/// A repository that hydrates aggregates by replaying their event history
/// (optionally starting from a snapshot) and persists new state as an
/// append to the event store.
pub struct EventSourcedRepository<A, S, SS>
where
    A: Aggregate,
    S: EventStore<A>,
    SS: SnapshotStore<A>,
{
    store: Arc<S>,
    snapshot_store: Option<Arc<SS>>,
    upcasters: UpcasterChain<A::Event>,
    snapshot_frequency: Option<i64>,
    _phantom: PhantomData<A>,
}

impl<A, S, SS> EventSourcedRepository<A, S, SS>
where
    A: Aggregate,
    S: EventStore<A>,
    SS: SnapshotStore<A>,
{
    /// Creates a repository over `store`, optionally taking snapshots from
    /// `snapshot_store`.
    pub fn new(store: Arc<S>, snapshot_store: Option<Arc<SS>>) -> Self {
        Self {
            store,
            snapshot_store,
            upcasters: UpcasterChain::new(),
            snapshot_frequency: None,
            _phantom: PhantomData,
        }
    }

    /// Sets the upcaster chain applied to raw history before deserialization.
    #[must_use]
    pub fn with_upcasters(mut self, upcasters: UpcasterChain<A::Event>) -> Self {
        self.upcasters = upcasters;
        self
    }

    /// Snapshots every `frequency` versions. The caller must ensure any
    /// [`crate::store::event_store::EventStore::compact`] call keeps at
    /// least the events since the last snapshot.
    #[must_use]
    pub fn with_snapshot_frequency(mut self, frequency: Option<i64>) -> Self {
        self.snapshot_frequency = frequency;
        self
    }
}

#[async_trait]
impl<A, S, SS> Repository<A> for EventSourcedRepository<A, S, SS>
where
    A: Aggregate,
    S: EventStore<A> + 'static,
    SS: SnapshotStore<A> + 'static,
{
    #[instrument(skip(self), fields(id = %id))]
    async fn get_by_id(&self, id: &A::Id) -> Result<A> {
        let snapshot = match &self.snapshot_store {
            Some(snapshot_store) => snapshot_store.load(id).await?,
            None => None,
        };

        let (mut aggregate, from_version, has_snapshot) = match snapshot {
            Some(stored) => {
                let version = stored.version();
                let mut aggregate = A::from_snapshot(id.clone(), stored.into_snapshot());
                aggregate.set_original_version(version);
                (aggregate, version + 1, true)
            }
            None => (
                A::load_from_history(id.clone(), std::iter::empty::<crate::event::EventMessage<A::Event>>()),
                0,
                false,
            ),
        };

        let raw = self.store.load_raw(id, from_version).await?;
        if raw.is_empty() && !has_snapshot {
            return Err(Error::aggregate_not_found(id.to_string()));
        }
        for raw_event in raw {
            let upcasted = self.upcasters.upcast(raw_event)?;
            let payload: A::Event =
                serde_json::from_value(upcasted.payload).map_err(|e| Error::serialization(e.to_string()))?;
            let event = crate::event::EventMessage::new(
                payload,
                crate::event::EventMessageOptions {
                    aggregate_id: Some(id.to_string()),
                    aggregate_type: Some(A::AGGREGATE_TYPE.to_string()),
                    version: Some(upcasted.version),
                    ..Default::default()
                },
            );
            aggregate.replay(&event);
        }

        let final_version = aggregate.version();
        aggregate.set_original_version(final_version);
        Ok(aggregate)
    }

    #[instrument(skip(self, aggregate), fields(id = %aggregate.id()))]
    async fn save(&self, aggregate: &mut A) -> Result<()> {
        let changes = aggregate.changes().to_vec();
        if changes.is_empty() {
            return Ok(());
        }

        let expected_version = aggregate.original_version();
        self.store.append(aggregate.id(), expected_version, changes).await?;
        aggregate.clear_changes();

        let new_version = aggregate.version();
        aggregate.set_original_version(new_version);

        if let (Some(snapshot_store), Some(frequency)) = (&self.snapshot_store, self.snapshot_frequency) {
            if frequency > 0 && new_version / frequency > expected_version / frequency {
                snapshot_store.save(aggregate.id(), new_version, aggregate.snapshot()).await?;
            }
        }

        Ok(())
    }

    async fn get_version(&self, id: &A::Id) -> Result<i64> {
        self.store.last_version(id).await
    }

    async fn exists(&self, id: &A::Id) -> Result<bool> {
        Ok(self.store.last_version(id).await? > 0)
    }
}

/// A repository that persists only the aggregate's latest state, via a
/// [`StateStore`], instead of its full event history.
pub struct StateBasedRepository<A, SST>
where
    A: Aggregate,
    SST: StateStore<A>,
{
    store: Arc<SST>,
    _phantom: PhantomData<A>,
}

impl<A, SST> StateBasedRepository<A, SST>
where
    A: Aggregate,
    SST: StateStore<A>,
{
    /// Creates a repository over `store`.
    pub fn new(store: Arc<SST>) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    /// Persists a brand-new aggregate, equivalent to
    /// [`save`][Repository::save] with an expected version of 0.
    pub async fn create(&self, aggregate: &A) -> Result<()> {
        self.store.save(aggregate.id(), 0, 1, aggregate.snapshot()).await
    }
}

#[async_trait]
impl<A, SST> Repository<A> for StateBasedRepository<A, SST>
where
    A: Aggregate,
    SST: StateStore<A> + 'static,
{
    async fn get_by_id(&self, id: &A::Id) -> Result<A> {
        match self.store.load(id).await? {
            Some(record) => {
                let mut aggregate = A::from_snapshot(id.clone(), record.state);
                aggregate.set_original_version(record.version);
                Ok(aggregate)
            }
            None => Err(Error::aggregate_not_found(id.to_string())),
        }
    }

    async fn save(&self, aggregate: &mut A) -> Result<()> {
        let expected_version = aggregate.original_version();
        let new_version = expected_version + 1;
        self.store
            .save(aggregate.id(), expected_version, new_version, aggregate.snapshot())
            .await?;
        aggregate.set_original_version(new_version);
        Ok(())
    }

    async fn get_version(&self, id: &A::Id) -> Result<i64> {
        Ok(self.store.load(id).await?.map(|r| r.version).unwrap_or(0))
    }

    async fn exists(&self, id: &A::Id) -> Result<bool> {
        Ok(self.store.load(id).await?.is_some())
    }
}

/// A point-in-time comparison between an aggregate's event-sourced and
/// state-store versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// The version derived from the event store.
    pub event_sourced_version: i64,
    /// The version recorded in the state store (0 if absent).
    pub state_version: i64,
}

impl ConsistencyReport {
    /// Whether the two versions agree.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.event_sourced_version == self.state_version
    }
}

/// Coarse counters describing a hybrid repository's two backing stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageMetrics {
    /// The latest version found in the event store.
    pub event_store_version: i64,
    /// Whether a state-store record currently exists.
    pub has_state_record: bool,
}

/// A repository composing an event-sourced and a state-based strategy for
/// the same aggregate type: writes go to both, reads come from the
/// event-sourced side, and the state side is kept as a fast-read mirror.
pub struct HybridRepository<A, S, SS, SST>
where
    A: Aggregate,
    S: EventStore<A>,
    SS: SnapshotStore<A>,
    SST: StateStore<A>,
{
    event_sourced: EventSourcedRepository<A, S, SS>,
    state_based: StateBasedRepository<A, SST>,
}

impl<A, S, SS, SST> HybridRepository<A, S, SS, SST>
where
    A: Aggregate,
    S: EventStore<A> + 'static,
    SS: SnapshotStore<A> + 'static,
    SST: StateStore<A> + 'static,
{
    /// Composes an event-sourced and a state-based repository.
    pub fn new(event_sourced: EventSourcedRepository<A, S, SS>, state_based: StateBasedRepository<A, SST>) -> Self {
        Self { event_sourced, state_based }
    }

    /// Rebuilds the state-store mirror for `id` from the event store's
    /// current state, overwriting whatever the state store holds.
    pub async fn sync_state_from_events(&self, id: &A::Id) -> Result<()> {
        let aggregate = self.event_sourced.get_by_id(id).await?;
        let current_state_version = self.state_based.get_version(id).await?;
        self.state_based
            .store
            .save(id, current_state_version, aggregate.version(), aggregate.snapshot())
            .await
    }

    /// Compares the event-sourced and state-store versions for `id`.
    pub async fn validate_consistency(&self, id: &A::Id) -> Result<ConsistencyReport> {
        let event_sourced_version = self.event_sourced.get_version(id).await?;
        let state_version = self.state_based.get_version(id).await?;
        Ok(ConsistencyReport {
            event_sourced_version,
            state_version,
        })
    }

    /// Reports coarse counters for both backing stores.
    pub async fn storage_metrics(&self, id: &A::Id) -> Result<StorageMetrics> {
        Ok(StorageMetrics {
            event_store_version: self.event_sourced.get_version(id).await?,
            has_state_record: self.state_based.exists(id).await?,
        })
    }
}

#[async_trait]
impl<A, S, SS, SST> Repository<A> for HybridRepository<A, S, SS, SST>
where
    A: Aggregate,
    S: EventStore<A> + 'static,
    SS: SnapshotStore<A> + 'static,
    SST: StateStore<A> + 'static,
{
    async fn get_by_id(&self, id: &A::Id) -> Result<A> {
        self.event_sourced.get_by_id(id).await
    }

    async fn save(&self, aggregate: &mut A) -> Result<()> {
        self.event_sourced.save(aggregate).await?;
        self.sync_state_from_events(aggregate.id()).await
    }

    async fn get_version(&self, id: &A::Id) -> Result<i64> {
        self.event_sourced.get_version(id).await
    }

    async fn exists(&self, id: &A::Id) -> Result<bool> {
        self.event_sourced.exists(id).await
    }
}
