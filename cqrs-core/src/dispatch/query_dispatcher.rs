//! The query dispatcher: a thread-safe `query_type → handler` registry.
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::instrument;

use crate::dispatch::CancellationToken;
use crate::error::{Error, ErrorCode, Result};
use crate::query::{Query, QueryResult};

/// What a successful [`QueryHandler`] invocation produced.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    /// The opaque result payload.
    pub data: serde_json::Value,
    /// Total matches before pagination, when known.
    pub total_count: Option<u64>,
}

/// Handles one query type, typically by reading a read-model store.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Executes `query`, returning the outcome or a coded failure.
    async fn handle(&self, query: Query) -> Result<HandlerOutcome>;
}

/// Routes queries to registered handlers by `query_type`.
#[derive(Default)]
pub struct QueryDispatcher {
    handlers: DashMap<String, Arc<dyn QueryHandler>>,
}

impl QueryDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `query_type`.
    ///
    /// # Errors
    /// Returns [`ErrorCode::QueryValidation`] if `query_type` is empty or a
    /// handler is already registered for it.
    pub fn register_handler(&self, query_type: impl Into<String>, handler: Arc<dyn QueryHandler>) -> Result<()> {
        let query_type = query_type.into();
        if query_type.trim().is_empty() {
            return Err(Error::new(ErrorCode::QueryValidation, "query_type must not be empty"));
        }
        if self.handlers.contains_key(&query_type) {
            return Err(Error::new(
                ErrorCode::QueryValidation,
                format!("a handler is already registered for query type '{query_type}'"),
            ));
        }
        self.handlers.insert(query_type, handler);
        Ok(())
    }

    /// Removes the handler registered for `query_type`, if any.
    pub fn unregister(&self, query_type: &str) {
        self.handlers.remove(query_type);
    }

    /// Dispatches `query` to its registered handler, never returning a
    /// top-level error: every failure is carried inside [`QueryResult`].
    #[instrument(skip(self, query), fields(query_type = %query.query_type))]
    pub async fn dispatch(&self, query: Query) -> QueryResult {
        self.dispatch_with_cancellation(query, &CancellationToken::new()).await
    }

    /// As [`dispatch`][Self::dispatch], but races the handler against
    /// `cancel` so a cancelled caller is not kept waiting on a stuck handler.
    pub async fn dispatch_with_cancellation(&self, query: Query, cancel: &CancellationToken) -> QueryResult {
        let started = Instant::now();

        if let Err(error) = query.validate() {
            return QueryResult::failed(error, started.elapsed());
        }

        let handler = match self.handlers.get(&query.query_type) {
            Some(handler) => handler.clone(),
            None => {
                return QueryResult::failed(
                    Error::new(
                        ErrorCode::QueryValidation,
                        format!("no handler registered for query type '{}'", query.query_type),
                    ),
                    started.elapsed(),
                );
            }
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::new(ErrorCode::QueryValidation, "query dispatch cancelled")),
            result = handler.handle(query) => result,
        };

        match outcome {
            Ok(outcome) => {
                let mut result = QueryResult::ok(outcome.data, outcome.total_count, started.elapsed());
                result.page = None;
                result.page_size = None;
                result
            }
            Err(error) => QueryResult::failed(error, started.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl QueryHandler for Echo {
        async fn handle(&self, query: Query) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome {
                data: serde_json::json!({"query_type": query.query_type}),
                total_count: Some(1),
            })
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let dispatcher = QueryDispatcher::new();
        dispatcher.register_handler("ListAccounts", Arc::new(Echo)).unwrap();

        let result = dispatcher.dispatch(Query::new("ListAccounts")).await;
        assert!(result.success);
        assert_eq!(result.total_count, Some(1));
    }

    #[tokio::test]
    async fn dispatch_without_handler_fails_inside_result() {
        let dispatcher = QueryDispatcher::new();
        let result = dispatcher.dispatch(Query::new("Unknown")).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, ErrorCode::QueryValidation);
    }

    #[tokio::test]
    async fn register_rejects_duplicate_query_type() {
        let dispatcher = QueryDispatcher::new();
        dispatcher.register_handler("ListAccounts", Arc::new(Echo)).unwrap();
        let err = dispatcher.register_handler("ListAccounts", Arc::new(Echo)).unwrap_err();
        assert_eq!(err.code, ErrorCode::QueryValidation);

        dispatcher.unregister("ListAccounts");
        assert!(dispatcher.register_handler("ListAccounts", Arc::new(Echo)).is_ok());
    }
}
