//! Command and query envelopes, validation, pagination, and sorting (C6).
//!
//! These are the shapes dispatchers (see [`crate::dispatch`]) accept and
//! return; they carry no behavior of their own beyond simple validation.
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::serialization::EventRecord;

/// A command envelope: an opaque payload plus the routing metadata a
/// dispatcher needs to find a handler and guard against replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Unique id for this command instance (used as the causation id of any
    /// resulting events).
    pub command_id: String,
    /// The routing key a dispatcher's handler registry is keyed on.
    pub command_type: String,
    /// The target aggregate's id, if already known.
    pub aggregate_id: Option<String>,
    /// The opaque command payload.
    pub payload: Value,
    /// Free-form metadata (tenant id, correlation id, etc.).
    pub metadata: HashMap<String, Value>,
}

impl Command {
    /// Creates a command with a fresh id and empty metadata.
    #[must_use]
    pub fn new(command_type: impl Into<String>, payload: Value) -> Self {
        Self {
            command_id: crate::error::new_id(),
            command_type: command_type.into(),
            aggregate_id: None,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Sets the target aggregate id.
    #[must_use]
    pub fn with_aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    /// Validates that the command is well-formed enough to dispatch.
    ///
    /// # Errors
    /// Returns [`crate::error::ErrorCode::CommandValidation`] if
    /// `command_type` is empty.
    pub fn validate(&self) -> Result<()> {
        if self.command_type.trim().is_empty() {
            return Err(Error::new(
                crate::error::ErrorCode::CommandValidation,
                "command_type must not be empty",
            ));
        }
        Ok(())
    }
}

/// The outcome of dispatching a [`Command`]. Every failure is surfaced here,
/// never as a top-level `Err`, so callers have a single success check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the command was handled without error.
    pub success: bool,
    /// The failure, if any.
    pub error: Option<Error>,
    /// Events produced by a successful handler, in apply order, in the
    /// canonical stored-event shape (the dispatcher is generic over
    /// aggregate type and cannot name a concrete event payload type).
    pub events: Vec<EventRecord>,
    /// The aggregate acted upon, if known.
    pub aggregate_id: Option<String>,
    /// The aggregate's version after the command was applied.
    pub version: i64,
    /// An opaque result payload a handler may attach.
    pub data: Option<Value>,
    /// Wall-clock time the dispatcher spent in the handler.
    pub execution_time: Duration,
}

impl CommandResult {
    /// Builds a successful result.
    #[must_use]
    pub fn ok(aggregate_id: Option<String>, version: i64, events: Vec<EventRecord>, execution_time: Duration) -> Self {
        Self {
            success: true,
            error: None,
            events,
            aggregate_id,
            version,
            data: None,
            execution_time,
        }
    }

    /// Builds a failed result wrapping `error`.
    #[must_use]
    pub fn failed(error: Error, execution_time: Duration) -> Self {
        Self {
            success: false,
            error: Some(error),
            events: Vec::new(),
            aggregate_id: None,
            version: 0,
            data: None,
            execution_time,
        }
    }

    /// Attaches an opaque result payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_command_type() {
        let cmd = Command::new("", Value::Null);
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_command() {
        let cmd = Command::new("OpenAccount", serde_json::json!({"owner": "alice"}));
        assert!(cmd.validate().is_ok());
    }
}
