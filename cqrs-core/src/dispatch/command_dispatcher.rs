//! The command dispatcher: a thread-safe `command_type → handler` registry.
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::instrument;

use crate::command::{Command, CommandResult};
use crate::dispatch::CancellationToken;
use crate::error::{Error, ErrorCode, Result};
use crate::serialization::EventRecord;

/// What a successful [`CommandHandler`] invocation produced.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    /// The aggregate acted upon, if any.
    pub aggregate_id: Option<String>,
    /// The aggregate's version after the command was applied.
    pub version: i64,
    /// Events persisted as a result of handling the command.
    pub events: Vec<EventRecord>,
    /// An opaque result payload.
    pub data: Option<serde_json::Value>,
}

/// Handles one command type. Implementations typically load an aggregate
/// via a repository, invoke domain logic, persist the resulting changes,
/// and publish the persisted events.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Executes `command`, returning the outcome or a coded failure.
    async fn handle(&self, command: Command) -> Result<HandlerOutcome>;
}

/// Routes commands to registered handlers by `command_type`.
#[derive(Default)]
pub struct CommandDispatcher {
    handlers: DashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `command_type`.
    ///
    /// # Errors
    /// Returns [`ErrorCode::CommandValidation`] if `command_type` is empty
    /// or a handler is already registered for it.
    pub fn register_handler(&self, command_type: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Result<()> {
        let command_type = command_type.into();
        if command_type.trim().is_empty() {
            return Err(Error::new(ErrorCode::CommandValidation, "command_type must not be empty"));
        }
        if self.handlers.contains_key(&command_type) {
            return Err(Error::new(
                ErrorCode::CommandValidation,
                format!("a handler is already registered for command type '{command_type}'"),
            ));
        }
        self.handlers.insert(command_type, handler);
        Ok(())
    }

    /// Removes the handler registered for `command_type`, if any.
    pub fn unregister(&self, command_type: &str) {
        self.handlers.remove(command_type);
    }

    /// Dispatches `command` to its registered handler, never returning a
    /// top-level error: every failure is carried inside [`CommandResult`].
    #[instrument(skip(self, command), fields(command_type = %command.command_type))]
    pub async fn dispatch(&self, command: Command) -> CommandResult {
        self.dispatch_with_cancellation(command, &CancellationToken::new()).await
    }

    /// As [`dispatch`][Self::dispatch], but races the handler against
    /// `cancel` so a cancelled caller is not kept waiting on a stuck handler.
    pub async fn dispatch_with_cancellation(&self, command: Command, cancel: &CancellationToken) -> CommandResult {
        let started = Instant::now();

        if let Err(error) = command.validate() {
            return CommandResult::failed(error, started.elapsed());
        }

        let handler = match self.handlers.get(&command.command_type) {
            Some(handler) => handler.clone(),
            None => {
                return CommandResult::failed(
                    Error::new(
                        ErrorCode::CommandValidation,
                        format!("no handler registered for command type '{}'", command.command_type),
                    ),
                    started.elapsed(),
                );
            }
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::new(ErrorCode::CommandValidation, "command dispatch cancelled")),
            result = handler.handle(command) => result,
        };

        match outcome {
            Ok(outcome) => {
                let mut result = CommandResult::ok(outcome.aggregate_id, outcome.version, outcome.events, started.elapsed());
                if let Some(data) = outcome.data {
                    result = result.with_data(data);
                }
                result
            }
            Err(error) => CommandResult::failed(error, started.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn handle(&self, command: Command) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome {
                aggregate_id: command.aggregate_id,
                version: 1,
                events: Vec::new(),
                data: Some(command.payload),
            })
        }
    }

    struct Failing;

    #[async_trait]
    impl CommandHandler for Failing {
        async fn handle(&self, _command: Command) -> Result<HandlerOutcome> {
            Err(Error::new(ErrorCode::ValidationError, "always fails"))
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let dispatcher = CommandDispatcher::new();
        dispatcher.register_handler("Echo", Arc::new(Echo)).unwrap();

        let result = dispatcher.dispatch(Command::new("Echo", serde_json::json!({"x": 1}))).await;
        assert!(result.success);
        assert_eq!(result.data.unwrap(), serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn dispatch_without_handler_fails_inside_result() {
        let dispatcher = CommandDispatcher::new();
        let result = dispatcher.dispatch(Command::new("Unknown", serde_json::Value::Null)).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, ErrorCode::CommandValidation);
    }

    #[tokio::test]
    async fn register_rejects_duplicate_command_type() {
        let dispatcher = CommandDispatcher::new();
        dispatcher.register_handler("Echo", Arc::new(Echo)).unwrap();
        let err = dispatcher.register_handler("Echo", Arc::new(Echo)).unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandValidation);

        dispatcher.unregister("Echo");
        assert!(dispatcher.register_handler("Echo", Arc::new(Echo)).is_ok());
    }

    #[tokio::test]
    async fn handler_error_is_carried_in_result() {
        let dispatcher = CommandDispatcher::new();
        dispatcher.register_handler("Fail", Arc::new(Failing)).unwrap();
        let result = dispatcher.dispatch(Command::new("Fail", serde_json::Value::Null)).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, ErrorCode::ValidationError);
    }
}
