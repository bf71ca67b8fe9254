//! The state store (C11): a non-event-sourced persistence strategy for
//! aggregates that only need their latest state, not a full history.
//! Concurrent writers are serialized with a [`DistributedLock`] so the
//! read-modify-write cycle is safe across processes, not just threads.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::aggregate::Aggregate;
use crate::error::{Error, ErrorCode, Result};
use crate::lock::DistributedLock;

/// The default time a write lock is held before it is considered
/// abandoned and may be reacquired by another writer.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// A persisted aggregate state, versioned for optimistic concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "S: Serialize",
    deserialize = "S: serde::de::DeserializeOwned"
))]
pub struct StateRecord<S> {
    /// The aggregate's version at the time this state was saved.
    pub version: i64,
    /// The aggregate's latest state.
    pub state: S,
}

/// Persists and loads the latest state of an aggregate directly, without an
/// event history. Writes go through an optimistic read-modify-write cycle:
/// the caller reads the current version, computes the new state, then calls
/// [`save`][Self::save] with the version it read — a mismatch means someone
/// else wrote first and the caller must retry.
#[async_trait]
pub trait StateStore<A: Aggregate>: Send + Sync {
    /// Loads the latest persisted state, if any.
    async fn load(&self, id: &A::Id) -> Result<Option<StateRecord<A::Snapshot>>>;

    /// Saves `state` as the new latest version, failing with
    /// [`ErrorCode::ConcurrencyConflict`] if the stored version does not
    /// equal `expected_version`. A brand-new record uses
    /// `expected_version = 0`.
    async fn save(
        &self,
        id: &A::Id,
        expected_version: i64,
        new_version: i64,
        state: A::Snapshot,
    ) -> Result<()>;

    /// Deletes the stored state for `id`, if any.
    async fn delete(&self, id: &A::Id) -> Result<()>;
}

/// An in-memory, lock-guarded state store. Useful for testing and for
/// single-process deployments of state-based aggregates.
pub struct InMemoryStateStore<A: Aggregate> {
    records: Arc<DashMap<String, StateRecord<A::Snapshot>>>,
    lock: Arc<dyn DistributedLock>,
    lock_ttl: Duration,
}

impl<A: Aggregate> InMemoryStateStore<A> {
    /// Creates a store using the given lock implementation and the default
    /// lock TTL.
    #[must_use]
    pub fn new(lock: Arc<dyn DistributedLock>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            lock,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Overrides the lock TTL (default [`DEFAULT_LOCK_TTL`]).
    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
}

#[async_trait]
impl<A> StateStore<A> for InMemoryStateStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self), fields(id = ?id))]
    async fn load(&self, id: &A::Id) -> Result<Option<StateRecord<A::Snapshot>>> {
        Ok(self.records.get(&id.to_string()).map(|r| r.clone()))
    }

    #[instrument(skip(self, state), fields(id = ?id, expected_version, new_version))]
    async fn save(
        &self,
        id: &A::Id,
        expected_version: i64,
        new_version: i64,
        state: A::Snapshot,
    ) -> Result<()> {
        let key = id.to_string();
        let handle = self
            .lock
            .try_lock(&key, self.lock_ttl)
            .await?
            .ok_or_else(|| Error::concurrency_conflict("could not acquire state write lock"))?;

        let current_version = self.records.get(&key).map(|r| r.version).unwrap_or(0);
        if current_version != expected_version {
            self.lock.unlock(handle).await?;
            return Err(Error::concurrency_conflict(format!(
                "expected version {expected_version}, found {current_version}"
            )));
        }

        self.records.insert(key, StateRecord { version: new_version, state });
        self.lock.unlock(handle).await?;
        Ok(())
    }

    async fn delete(&self, id: &A::Id) -> Result<()> {
        self.records.remove(&id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLock;
    use serde::{Deserialize as _, Serialize as _};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Balance {
        amount: u64,
    }
    impl crate::aggregate::Snapshot for Balance {}

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    enum NoEvent {}

    impl crate::event::Event for NoEvent {
        fn event_type(&self) -> &'static str {
            match *self {}
        }
        fn event_version(&self) -> u16 {
            match *self {}
        }
        fn event_source(&self) -> &'static str {
            match *self {}
        }
    }

    #[derive(Debug, Default)]
    struct Account;

    #[async_trait]
    impl Aggregate for Account {
        type Id = uuid::Uuid;
        type Event = NoEvent;
        type Command = ();
        type Snapshot = Balance;
        type Error = std::convert::Infallible;
        const AGGREGATE_TYPE: &'static str = "Account";
        fn root(&self) -> &crate::aggregate::AggregateRoot<Self::Id, Self::Event> {
            unimplemented!()
        }
        fn root_mut(&mut self) -> &mut crate::aggregate::AggregateRoot<Self::Id, Self::Event> {
            unimplemented!()
        }
        fn mutate(&mut self, _payload: &Self::Event) {}
        async fn handle(&self, _c: Self::Command) -> std::result::Result<Vec<Self::Event>, Self::Error> {
            Ok(vec![])
        }
        fn from_snapshot(_id: Self::Id, _s: Self::Snapshot) -> Self {
            Self
        }
        fn snapshot(&self) -> Self::Snapshot {
            Balance::default()
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = InMemoryStateStore::<Account>::new(Arc::new(InMemoryLock::new()));
        let id = uuid::Uuid::new_v4();
        store.save(&id, 0, 1, Balance { amount: 10 }).await.unwrap();

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.state.amount, 10);
    }

    #[tokio::test]
    async fn save_rejects_stale_expected_version() {
        let store = InMemoryStateStore::<Account>::new(Arc::new(InMemoryLock::new()));
        let id = uuid::Uuid::new_v4();
        store.save(&id, 0, 1, Balance { amount: 10 }).await.unwrap();

        let err = store.save(&id, 0, 1, Balance { amount: 20 }).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConcurrencyConflict);
    }
}
