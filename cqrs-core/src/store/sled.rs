//! A persistent `EventStore` implementation using `sled` (behind the
//! `sled-storage` feature).
use std::marker::PhantomData;

use async_trait::async_trait;
use tracing::instrument;

use crate::aggregate::Aggregate;
use crate::error::{Error, ErrorCode, Result};
use crate::event::EventMessage;
use crate::store::event_store::EventStore;
use crate::upcaster::RawStoredEvent;

/// A persistent, thread-safe event store backed by a `sled::Tree` per
/// aggregate, keyed `{aggregate_id}/{version}` for efficient ordered scans.
#[derive(Clone)]
pub struct SledEventStore<A: Aggregate> {
    db: sled::Db,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> SledEventStore<A> {
    /// Creates a new store over the given `sled` database.
    pub fn new(db: sled::Db) -> Self {
        Self {
            db,
            _phantom: PhantomData,
        }
    }

    fn tree(&self, aggregate_id: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(aggregate_id.as_bytes())
            .map_err(|e| Error::event_store(e.to_string()))
    }
}

fn store_err(e: impl std::fmt::Display) -> Error {
    Error::new(ErrorCode::EventStoreError, e.to_string())
}

/// Zero-pads the version so lexicographic key order (what `sled` sorts by)
/// matches numeric order for every `i64` value, including `scan_prefix`
/// ranges spanning more than nine events.
fn version_key(aggregate_id: &str, version: i64) -> String {
    format!("{aggregate_id}/{version:019}")
}

#[async_trait]
impl<A> EventStore<A> for SledEventStore<A>
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
        let tree = self.tree(&aggregate_id)?;

        let current_version = match tree.last().map_err(store_err)? {
            Some((_, v)) => {
                let e: EventMessage<A::Event> = serde_json::from_slice(&v).map_err(store_err)?;
                e.version()
            }
            None => 0,
        };

        if current_version != expected_version {
            return Err(Error::concurrency_conflict(format!(
                "expected version {expected_version}, found {current_version}"
            )));
        }

        let mut to_commit = Vec::with_capacity(events.len());
        for event in &events {
            let value = serde_json::to_vec(event).map_err(store_err)?;
            let key = version_key(&aggregate_id, event.version());
            to_commit.push((key, value));
        }

        tree.transaction(|tx| {
            for (key, value) in &to_commit {
                tx.insert(key.as_bytes(), value.as_slice())?;
            }
            Ok(())
        })
        .map_err(|e: sled::transaction::TransactionError| store_err(e))?;

        Ok(events)
    }

    #[instrument(skip(self), fields(id = ?id))]
    async fn load(&self, id: &A::Id) -> Result<Vec<EventMessage<A::Event>>> {
        let aggregate_id = id.to_string();
        let tree = self.tree(&aggregate_id)?;
        let prefix = format!("{aggregate_id}/");

        tree.scan_prefix(prefix.as_bytes())
            .map(|res| {
                let (_, v) = res.map_err(store_err)?;
                serde_json::from_slice(&v).map_err(store_err)
            })
            .collect()
    }

    #[instrument(skip(self), fields(id = ?id, version))]
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<EventMessage<A::Event>>> {
        let aggregate_id = id.to_string();
        let tree = self.tree(&aggregate_id)?;
        let prefix = format!("{aggregate_id}/");

        tree.scan_prefix(prefix.as_bytes())
            .map(|res| {
                let (_, v) = res.map_err(store_err)?;
                serde_json::from_slice(&v).map_err(store_err)
            })
            .collect::<Result<Vec<EventMessage<A::Event>>>>()
            .map(|events| events.into_iter().filter(|e| e.version() > version).collect())
    }

    async fn load_raw(&self, id: &A::Id, version: i64) -> Result<Vec<RawStoredEvent>> {
        let aggregate_id = id.to_string();
        let tree = self.tree(&aggregate_id)?;
        let prefix = format!("{aggregate_id}/");

        tree.scan_prefix(prefix.as_bytes())
            .map(|res| {
                let (_, v) = res.map_err(store_err)?;
                let stored: EventMessage<A::Event> = serde_json::from_slice(&v).map_err(store_err)?;
                let payload = serde_json::to_value(stored.payload()).map_err(store_err)?;
                Ok(RawStoredEvent {
                    aggregate_id: stored.aggregate_id().to_string(),
                    version: stored.version(),
                    event_version: stored.payload().event_version(),
                    event_type: stored.event_type().to_string(),
                    payload,
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(|events| events.into_iter().filter(|e| e.version > version).collect())
    }

    async fn compact(&self, id: &A::Id, before_version: i64) -> Result<u64> {
        let aggregate_id = id.to_string();
        let tree = self.tree(&aggregate_id)?;
        let prefix = format!("{aggregate_id}/");

        let mut discarded = 0u64;
        for res in tree.scan_prefix(prefix.as_bytes()) {
            let (key, v) = res.map_err(store_err)?;
            let stored: EventMessage<A::Event> = serde_json::from_slice(&v).map_err(store_err)?;
            if stored.version() < before_version {
                tree.remove(key).map_err(store_err)?;
                discarded += 1;
            }
        }
        Ok(discarded)
    }
}
