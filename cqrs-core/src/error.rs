//! The error taxonomy shared by every component in this crate.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Stable string codes for every error kind this crate can produce.
///
/// These are the wire-level codes from the coded error shape
/// `{code, message, cause, context}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// An aggregate could not be found.
    AggregateNotFound,
    /// An aggregate failed its own validation (empty id/type, etc).
    InvalidAggregate,
    /// A version mismatch or lock acquisition failure during a write.
    ConcurrencyConflict,
    /// A command failed validation before dispatch.
    CommandValidation,
    /// A query failed validation before dispatch.
    QueryValidation,
    /// An event failed validation (empty id/type/aggregate id).
    EventValidation,
    /// (De)serialization of a stored record failed.
    SerializationError,
    /// A generic validation failure not covered by a more specific code.
    ValidationError,
    /// A generic "not found" failure not covered by a more specific code.
    NotFoundError,
    /// A repository-level failure (e.g. no factory configured for a strategy).
    RepositoryError,
    /// An event-store-level failure.
    EventStoreError,
    /// An event-bus-level failure (e.g. double start/stop).
    EventBusError,
    /// No snapshot exists for the requested aggregate.
    SnapshotNotFound,
    /// A snapshot failed its checksum or structural validation.
    SnapshotValidationFailed,
    /// A state-store-level failure.
    StateStoreError,
    /// A snapshot-store-level failure.
    SnapshotStoreError,
    /// A read-model-store-level failure.
    ReadStoreError,
    /// No read model exists for the requested id/type.
    ReadModelNotFound,
}

/// The coded error type used throughout this crate.
///
/// The wire shape is `{code, message, cause, context}`.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct Error {
    /// The stable error kind.
    pub code: ErrorCode,
    /// A human-readable message.
    pub message: String,
    /// An optional stringified cause (e.g. an underlying storage error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Free-form structured context (aggregate id, event type, etc).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

impl Error {
    /// Builds a new coded error with no cause or context.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            context: HashMap::new(),
        }
    }

    /// Attaches an underlying cause, stringified.
    #[must_use]
    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Attaches a single piece of structured context.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Shorthand for [`ErrorCode::AggregateNotFound`].
    pub fn aggregate_not_found(aggregate_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::AggregateNotFound, "aggregate not found")
            .with_context("aggregate_id", aggregate_id)
    }

    /// Shorthand for [`ErrorCode::ConcurrencyConflict`].
    pub fn concurrency_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConcurrencyConflict, message)
    }

    /// Shorthand for [`ErrorCode::RepositoryError`].
    pub fn repository(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RepositoryError, message)
    }

    /// Shorthand for [`ErrorCode::EventStoreError`].
    pub fn event_store(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EventStoreError, message)
    }

    /// Shorthand for [`ErrorCode::SerializationError`].
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SerializationError, message)
    }

    /// True for the three "not found" codes and the aggregate-not-found
    /// sentinel.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::AggregateNotFound
                | ErrorCode::NotFoundError
                | ErrorCode::SnapshotNotFound
                | ErrorCode::ReadModelNotFound
        )
    }
}

/// Recognises the not-found error codes, for callers that only have a
/// `&Error` and not an owned value to call [`Error::is_not_found`] on.
#[must_use]
pub fn is_not_found_error(err: &Error) -> bool {
    err.is_not_found()
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Generates a new opaque unique identifier (UUID v4).
///
/// Centralized here so every component that needs an id (event id, command
/// id, subscription id, ...) generates it the same way.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Computes a hex-encoded SHA-256 checksum over an arbitrary sequence of
/// stringified fields, joined by a `|` separator.
///
/// Used by [`crate::event::EventMessage::checksum`] and
/// [`crate::store::snapshot_store::Snapshot::checksum`] to compute an
/// integrity checksum over a canonical tuple of fields.
#[must_use]
pub fn checksum_fields(fields: &[&str]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_recognises_all_sentinel_codes() {
        assert!(Error::new(ErrorCode::AggregateNotFound, "x").is_not_found());
        assert!(Error::new(ErrorCode::NotFoundError, "x").is_not_found());
        assert!(Error::new(ErrorCode::SnapshotNotFound, "x").is_not_found());
        assert!(Error::new(ErrorCode::ReadModelNotFound, "x").is_not_found());
        assert!(!Error::new(ErrorCode::ConcurrencyConflict, "x").is_not_found());
    }

    #[test]
    fn checksum_is_deterministic_and_order_sensitive() {
        let a = checksum_fields(&["1", "2", "3"]);
        let b = checksum_fields(&["1", "2", "3"]);
        let c = checksum_fields(&["3", "2", "1"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn new_id_is_unique() {
        assert_ne!(new_id(), new_id());
    }
}
