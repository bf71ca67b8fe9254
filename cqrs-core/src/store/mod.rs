//! The store module: the event/snapshot/state/read-model store traits (C9-C12)
//! and their backend implementations, gated behind storage-strategy features.

/// The event store trait and the raw-event type it shares with upcasting.
pub mod event_store;
/// The snapshot store trait and stored-snapshot envelope.
pub mod snapshot_store;
/// The state store trait, for non-event-sourced aggregates.
pub mod state_store;
/// The read-model store trait and query criteria.
pub mod read_model_store;

// The in-memory implementations are compiled when the `in-memory` feature is
// enabled (this is the default).
#[cfg(feature = "in-memory")]
/// An in-memory event store.
pub mod in_memory;

#[cfg(feature = "in-memory")]
/// An in-memory snapshot store.
pub mod in_memory_snapshot;

// The persistent `sled` implementations are compiled when the `sled-storage`
// feature is enabled.
#[cfg(feature = "sled-storage")]
/// A persistent event store using `sled`.
pub mod sled;

#[cfg(feature = "sled-storage")]
/// A persistent snapshot store using `sled`.
pub mod sled_snapshot;

// SQLx / Postgres implementation compiled when the `postgres-storage` feature
// is enabled.
#[cfg(feature = "postgres-storage")]
pub mod sqlx_postgres;

// Redis implementation compiled when the `redis-storage` feature is enabled.
#[cfg(feature = "redis-storage")]
/// A distributed event/snapshot store using `redis`.
pub mod redis;
