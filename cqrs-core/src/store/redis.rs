//! A `redis`-backed `EventStore`/`SnapshotStore` (behind the `redis-storage`
//! feature). Each aggregate's stream is a Redis list, one JSON-encoded
//! envelope per element; appends are a Lua script so the version check and
//! the `RPUSH` are atomic without a separate `WATCH`/`MULTI` round trip.
use std::marker::PhantomData;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::instrument;

use crate::aggregate::Aggregate;
use crate::error::{Error, ErrorCode, Result};
use crate::event::EventMessage;
use crate::store::event_store::EventStore;
use crate::store::snapshot_store::{SnapshotStore, StoredSnapshot};
use crate::upcaster::RawStoredEvent;

fn store_err(e: impl std::fmt::Display) -> Error {
    Error::new(ErrorCode::EventStoreError, e.to_string())
}

fn stream_key(aggregate_type: &str, aggregate_id: &str) -> String {
    format!("cqrs:events:{aggregate_type}:{aggregate_id}")
}

fn snapshot_key(aggregate_type: &str, aggregate_id: &str) -> String {
    format!("cqrs:snapshot:{aggregate_type}:{aggregate_id}")
}

const APPEND_SCRIPT: &str = r"
    local key = KEYS[1]
    local expected_version = tonumber(ARGV[1])
    local current = redis.call('LLEN', key)
    if current ~= expected_version then
        return current
    end
    for i = 2, #ARGV do
        redis.call('RPUSH', key, ARGV[i])
    end
    return -1
";

/// A Redis-backed event store. One list per `(aggregate_type, aggregate_id)`.
#[derive(Clone)]
pub struct RedisEventStore<A: Aggregate> {
    conn: ConnectionManager,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> RedisEventStore<A> {
    /// Creates a store over an established connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<A> EventStore<A> for RedisEventStore<A>
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
        if events.is_empty() {
            return Ok(events);
        }
        let key = stream_key(A::AGGREGATE_TYPE, &id.to_string());
        let mut conn = self.conn.clone();

        let mut script = Script::new(APPEND_SCRIPT).key(&key).arg(expected_version);
        let payloads: Result<Vec<String>> = events
            .iter()
            .map(|e| serde_json::to_string(e).map_err(|e| Error::serialization(e.to_string())))
            .collect();
        for payload in payloads? {
            script = script.arg(payload);
        }

        let outcome: i64 = script.invoke_async(&mut conn).await.map_err(store_err)?;
        if outcome != -1 {
            return Err(Error::concurrency_conflict(format!(
                "expected version {expected_version}, found {outcome}"
            )));
        }
        Ok(events)
    }

    #[instrument(skip(self), fields(id = ?id))]
    async fn load(&self, id: &A::Id) -> Result<Vec<EventMessage<A::Event>>> {
        self.load_from(id, 0).await
    }

    #[instrument(skip(self), fields(id = ?id, version))]
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<EventMessage<A::Event>>> {
        let key = stream_key(A::AGGREGATE_TYPE, &id.to_string());
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&key)
            .arg(version.max(0))
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(|e| Error::serialization(e.to_string())))
            .collect()
    }

    async fn load_raw(&self, id: &A::Id, version: i64) -> Result<Vec<RawStoredEvent>> {
        let events = self.load_from(id, version).await?;
        events
            .into_iter()
            .map(|e| {
                let payload = serde_json::to_value(e.payload()).map_err(|e| Error::serialization(e.to_string()))?;
                Ok(RawStoredEvent {
                    aggregate_id: e.aggregate_id().to_string(),
                    version: e.version(),
                    event_version: e.payload().event_version(),
                    event_type: e.event_type().to_string(),
                    payload,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(id = ?id, before_version))]
    async fn compact(&self, id: &A::Id, before_version: i64) -> Result<u64> {
        let key = stream_key(A::AGGREGATE_TYPE, &id.to_string());
        let mut conn = self.conn.clone();
        let before: i64 = redis::cmd("LLEN").arg(&key).query_async(&mut conn).await.map_err(store_err)?;
        // Events are pushed in order starting at version 1, so version `v`
        // lives at list index `v - 1`; trimming from `before_version - 1`
        // keeps the boundary version and discards everything before it.
        let _: () = redis::cmd("LTRIM")
            .arg(&key)
            .arg((before_version - 1).max(0))
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        let after: i64 = redis::cmd("LLEN").arg(&key).query_async(&mut conn).await.map_err(store_err)?;
        Ok((before - after).max(0) as u64)
    }
}

/// A Redis-backed snapshot store, one string key per `(aggregate_type,
/// aggregate_id)`.
#[derive(Clone)]
pub struct RedisSnapshotStore<A: Aggregate> {
    conn: ConnectionManager,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> RedisSnapshotStore<A> {
    /// Creates a store over an established connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<A> SnapshotStore<A> for RedisSnapshotStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self, snapshot), fields(aggregate_id = ?aggregate_id, version))]
    async fn save(&self, aggregate_id: &A::Id, version: i64, snapshot: A::Snapshot) -> Result<()> {
        let stored = StoredSnapshot::new(A::AGGREGATE_TYPE, aggregate_id.to_string(), version, snapshot)?;
        let value = serde_json::to_string(&stored).map_err(|e| Error::serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(snapshot_key(A::AGGREGATE_TYPE, &aggregate_id.to_string()))
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    #[instrument(skip(self), fields(aggregate_id = ?aggregate_id))]
    async fn load(&self, aggregate_id: &A::Id) -> Result<Option<StoredSnapshot<A::Snapshot>>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(snapshot_key(A::AGGREGATE_TYPE, &aggregate_id.to_string()))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v).map_err(|e| Error::serialization(e.to_string()))?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, aggregate_id: &A::Id) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(snapshot_key(A::AGGREGATE_TYPE, &aggregate_id.to_string()))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
