//! A `sqlx`/PostgreSQL implementation of the store traits (behind the
//! `postgres-storage` cargo feature).
#![allow(clippy::missing_errors_doc)]

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use sqlx::PgPool;
use tracing::instrument;

use crate::aggregate::Aggregate;
use crate::error::{Error, ErrorCode, Result};
use crate::event::{EventMessage, EventMessageOptions};
use crate::store::event_store::EventStore;
use crate::store::snapshot_store::{SnapshotStore, StoredSnapshot};
use crate::upcaster::RawStoredEvent;

fn to_store_error(e: sqlx::Error) -> Error {
    // Postgres unique_violation (23505): the only way this can fire on the
    // events table is two transactions racing to insert the same
    // (aggregate_id, version) pair after both passed the version check —
    // i.e. a real concurrency conflict, even though the version check
    // itself didn't catch it.
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.code().as_deref() == Some("23505") {
            return Error::concurrency_conflict(e.to_string());
        }
    }
    Error::new(ErrorCode::EventStoreError, e.to_string())
}

fn to_serde_error(e: serde_json::Error) -> Error {
    Error::serialization(e.to_string())
}

/// A `sqlx`-backed event store for PostgreSQL.
#[derive(Debug, Clone)]
pub struct SqlxEventStore<A: Aggregate> {
    pool: PgPool,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> SqlxEventStore<A> {
    /// Creates a new store over the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _phantom: PhantomData,
        }
    }

    /// Ensures the `events` table exists.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS events (
                    event_id TEXT NOT NULL,
                    aggregate_id TEXT NOT NULL,
                    aggregate_type TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    event_version SMALLINT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    metadata JSONB NOT NULL,
                    timestamp TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (aggregate_id, version)
                );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

type EventRow = (
    String,
    String,
    String,
    i64,
    i16,
    String,
    serde_json::Value,
    serde_json::Value,
    chrono::DateTime<chrono::Utc>,
);

fn row_to_event<P>(row: EventRow) -> Result<EventMessage<P>>
where
    P: crate::event::Event + DeserializeOwned,
{
    let (event_id, aggregate_id, aggregate_type, version, _event_version, _event_type, payload, metadata, timestamp) = row;
    let payload: P = serde_json::from_value(payload).map_err(to_serde_error)?;
    Ok(EventMessage::new(
        payload,
        EventMessageOptions {
            event_id: Some(event_id),
            aggregate_id: Some(aggregate_id),
            aggregate_type: Some(aggregate_type),
            version: Some(version),
            metadata: serde_json::from_value(metadata).unwrap_or_default(),
            timestamp: Some(timestamp),
        },
    ))
}

#[async_trait::async_trait]
impl<A> EventStore<A> for SqlxEventStore<A>
where
    A: Aggregate,
    A::Event: Serialize + DeserializeOwned + Send + Sync,
    A::Id: Clone + Serialize + Send + Sync,
{
    #[instrument(skip(self, events), fields(id = ?id))]
    async fn append(
        &self,
        id: &A::Id,
        expected_version: i64,
        events: Vec<EventMessage<A::Event>>,
    ) -> Result<Vec<EventMessage<A::Event>>> {
        if events.is_empty() {
            return Ok(events);
        }

        let aggregate_id = id.to_string();
        let mut tx = self.pool.begin().await.map_err(to_store_error)?;

        // Serializes concurrent appends to the same aggregate for the rest
        // of this transaction: a second transaction racing on the same
        // `aggregate_id` blocks here until the first commits or rolls back,
        // so the version check below can't race with another writer's
        // check. Released automatically on commit/rollback.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&aggregate_id)
            .execute(&mut *tx)
            .await
            .map_err(to_store_error)?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(&aggregate_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(to_store_error)?
                .flatten();

        if current_version.unwrap_or(0) != expected_version {
            return Err(Error::concurrency_conflict(format!(
                "expected version {expected_version}, found {}",
                current_version.unwrap_or(0)
            )));
        }

        for event in &events {
            let payload = serde_json::to_value(event.payload()).map_err(to_serde_error)?;
            let metadata = serde_json::to_value(event.metadata()).map_err(to_serde_error)?;
            sqlx::query(
                r#"
                INSERT INTO events
                    (event_id, aggregate_id, aggregate_type, version, event_version, event_type, payload, metadata, timestamp)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(event.event_id())
            .bind(&aggregate_id)
            .bind(event.aggregate_type())
            .bind(event.version())
            .bind(event.payload().event_version() as i16)
            .bind(event.event_type())
            .bind(payload)
            .bind(metadata)
            .bind(event.timestamp())
            .execute(&mut *tx)
            .await
            .map_err(to_store_error)?;
        }

        tx.commit().await.map_err(to_store_error)?;
        Ok(events)
    }

    #[instrument(skip(self), fields(id = ?id))]
    async fn load(&self, id: &A::Id) -> Result<Vec<EventMessage<A::Event>>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT event_id, aggregate_id, aggregate_type, version, event_version, event_type, payload, metadata, timestamp FROM events WHERE aggregate_id = $1 ORDER BY version",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        rows.into_iter().map(row_to_event).collect()
    }

    #[instrument(skip(self), fields(id = ?id, version))]
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<EventMessage<A::Event>>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT event_id, aggregate_id, aggregate_type, version, event_version, event_type, payload, metadata, timestamp FROM events WHERE aggregate_id = $1 AND version > $2 ORDER BY version",
        )
        .bind(id.to_string())
        .bind(version)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        rows.into_iter().map(row_to_event).collect()
    }

    #[instrument(skip(self), fields(id = ?id, version))]
    async fn load_raw(&self, id: &A::Id, version: i64) -> Result<Vec<RawStoredEvent>> {
        let rows: Vec<(String, i64, i16, String, serde_json::Value)> = sqlx::query_as(
            "SELECT aggregate_id, version, event_version, event_type, payload FROM events WHERE aggregate_id = $1 AND version > $2 ORDER BY version",
        )
        .bind(id.to_string())
        .bind(version)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        Ok(rows
            .into_iter()
            .map(|(aggregate_id, version, event_version, event_type, payload)| RawStoredEvent {
                aggregate_id,
                version,
                event_version: event_version as u16,
                event_type,
                payload,
            })
            .collect())
    }

    #[instrument(skip(self), fields(id = ?id, before_version))]
    async fn compact(&self, id: &A::Id, before_version: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE aggregate_id = $1 AND version < $2")
            .bind(id.to_string())
            .bind(before_version)
            .execute(&self.pool)
            .await
            .map_err(to_store_error)?;
        Ok(result.rows_affected())
    }
}

/// A `sqlx`-backed snapshot store for PostgreSQL.
#[derive(Debug, Clone)]
pub struct SqlxSnapshotStore<A: Aggregate> {
    pool: PgPool,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> SqlxSnapshotStore<A> {
    /// Creates a new store over the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _phantom: PhantomData,
        }
    }

    /// Ensures the `snapshots` table exists.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS snapshots (
                    aggregate_type TEXT NOT NULL,
                    aggregate_id TEXT PRIMARY KEY,
                    version BIGINT NOT NULL,
                    payload JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<A> SnapshotStore<A> for SqlxSnapshotStore<A>
where
    A: Aggregate,
    A::Snapshot: Serialize + DeserializeOwned + Send + Sync,
    A::Id: Clone + Serialize + Send + Sync,
{
    #[instrument(skip(self, snapshot), fields(id = ?aggregate_id))]
    async fn save(&self, aggregate_id: &A::Id, version: i64, snapshot: A::Snapshot) -> Result<()> {
        let stored = StoredSnapshot::new(A::AGGREGATE_TYPE, aggregate_id.to_string(), version, snapshot)?;
        let payload = serde_json::to_value(stored.into_snapshot()).map_err(to_serde_error)?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_type, aggregate_id, version, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_id) DO UPDATE
            SET version = EXCLUDED.version,
                payload = EXCLUDED.payload;
            "#,
        )
        .bind(A::AGGREGATE_TYPE)
        .bind(aggregate_id.to_string())
        .bind(version)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(id = ?aggregate_id))]
    async fn load(&self, aggregate_id: &A::Id) -> Result<Option<StoredSnapshot<A::Snapshot>>> {
        let row: Option<(i64, serde_json::Value)> =
            sqlx::query_as("SELECT version, payload FROM snapshots WHERE aggregate_id = $1")
                .bind(aggregate_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(to_store_error)?;

        match row {
            Some((version, payload)) => {
                let snapshot: A::Snapshot = serde_json::from_value(payload).map_err(to_serde_error)?;
                Ok(Some(StoredSnapshot::new(
                    A::AGGREGATE_TYPE,
                    aggregate_id.to_string(),
                    version,
                    snapshot,
                )?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, aggregate_id: &A::Id) -> Result<()> {
        sqlx::query("DELETE FROM snapshots WHERE aggregate_id = $1")
            .bind(aggregate_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }
}
