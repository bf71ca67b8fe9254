//! An in-memory snapshot store.
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::instrument;

use crate::aggregate::Aggregate;
use crate::error::Result;
use crate::store::snapshot_store::{SnapshotStore, StoredSnapshot};

/// An in-memory, thread-safe snapshot store.
pub struct InMemorySnapshotStore<A: Aggregate> {
    snapshots: Arc<DashMap<String, StoredSnapshot<A::Snapshot>>>,
}

impl<A: Aggregate> Default for InMemorySnapshotStore<A> {
    fn default() -> Self {
        Self {
            snapshots: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl<A> SnapshotStore<A> for InMemorySnapshotStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self, snapshot), fields(aggregate_id = ?aggregate_id, version))]
    async fn save(&self, aggregate_id: &A::Id, version: i64, snapshot: A::Snapshot) -> Result<()> {
        let stored = StoredSnapshot::new(A::AGGREGATE_TYPE, aggregate_id.to_string(), version, snapshot)?;
        self.snapshots.insert(aggregate_id.to_string(), stored);
        Ok(())
    }

    #[instrument(skip(self), fields(aggregate_id = ?aggregate_id))]
    async fn load(&self, aggregate_id: &A::Id) -> Result<Option<StoredSnapshot<A::Snapshot>>> {
        Ok(self.snapshots.get(&aggregate_id.to_string()).map(|r| r.clone()))
    }

    async fn delete(&self, aggregate_id: &A::Id) -> Result<()> {
        self.snapshots.remove(&aggregate_id.to_string());
        Ok(())
    }
}
