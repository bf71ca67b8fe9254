//! A persistent `SnapshotStore` implementation using `sled` (behind the
//! `sled-storage` feature).
use std::marker::PhantomData;

use async_trait::async_trait;
use sled::Tree;
use tracing::instrument;

use crate::aggregate::Aggregate;
use crate::error::{Error, ErrorCode, Result};
use crate::store::snapshot_store::{SnapshotStore, StoredSnapshot};

fn store_err(e: impl std::fmt::Display) -> Error {
    Error::new(ErrorCode::SnapshotStoreError, e.to_string())
}

/// A persistent, thread-safe snapshot store backed by a dedicated
/// `sled::Tree`, keyed by aggregate id.
#[derive(Debug)]
pub struct SledSnapshotStore<A: Aggregate> {
    tree: Tree,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> SledSnapshotStore<A> {
    /// Creates a new store over the given tree. Callers should use a tree
    /// dedicated to snapshots, separate from the one used for events.
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<A> SnapshotStore<A> for SledSnapshotStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self, snapshot), fields(aggregate_id = ?aggregate_id, version))]
    async fn save(&self, aggregate_id: &A::Id, version: i64, snapshot: A::Snapshot) -> Result<()> {
        let stored = StoredSnapshot::new(A::AGGREGATE_TYPE, aggregate_id.to_string(), version, snapshot)?;
        let value = serde_json::to_vec(&stored).map_err(store_err)?;
        self.tree.insert(aggregate_id.to_string().as_bytes(), value).map_err(store_err)?;
        Ok(())
    }

    #[instrument(skip(self), fields(aggregate_id = ?aggregate_id))]
    async fn load(&self, aggregate_id: &A::Id) -> Result<Option<StoredSnapshot<A::Snapshot>>> {
        let key = aggregate_id.to_string();
        match self.tree.get(key).map_err(store_err)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value).map_err(store_err)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, aggregate_id: &A::Id) -> Result<()> {
        self.tree.remove(aggregate_id.to_string().as_bytes()).map_err(store_err)?;
        Ok(())
    }
}
