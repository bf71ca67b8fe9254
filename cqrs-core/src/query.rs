//! Query envelopes, pagination, and sorting (C6). See also [`crate::command`].
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Sort direction for a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

/// One entry of a multi-field sort: the field to compare on, the direction,
/// and an optional name of a transform to apply before comparing (e.g.
/// case-folding), interpreted by the query handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortField {
    /// The field name within the result payload.
    pub field: String,
    /// The sort direction for this field.
    pub direction: SortDirection,
    /// An optional named transform (handler-defined) applied before compare.
    pub transform: Option<String>,
}

impl SortField {
    /// Creates an ascending sort on `field` with no transform.
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
            transform: None,
        }
    }

    /// Creates a descending sort on `field` with no transform.
    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
            transform: None,
        }
    }
}

/// Pagination, expressed either as page/page-size or as a raw offset/limit.
/// `offset`/`limit` take precedence when both are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pagination {
    /// 1-based page number.
    pub page: Option<u32>,
    /// Results per page.
    pub page_size: Option<u32>,
    /// Raw offset, overriding `page`/`page_size` when set.
    pub offset: Option<u64>,
    /// Raw limit, overriding `page_size` when set.
    pub limit: Option<u64>,
}

impl Pagination {
    /// Resolves to a concrete `(offset, limit)` pair, defaulting to
    /// `(0, None)` (unbounded) when nothing is specified.
    #[must_use]
    pub fn resolve(&self) -> (u64, Option<u64>) {
        if self.offset.is_some() || self.limit.is_some() {
            return (self.offset.unwrap_or(0), self.limit);
        }
        match (self.page, self.page_size) {
            (Some(page), Some(size)) if page > 0 => (u64::from(page - 1) * u64::from(size), Some(u64::from(size))),
            (_, Some(size)) => (0, Some(u64::from(size))),
            _ => (0, None),
        }
    }
}

/// A query envelope: a routing key, free-form filters, an optional sort
/// (single field, or a priority-ordered multi-field list), and pagination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    /// The routing key a dispatcher's handler registry is keyed on.
    pub query_type: String,
    /// Exact-match (or handler-defined) filters.
    pub filters: HashMap<String, Value>,
    /// Priority-ordered sort fields; empty means handler-defined default order.
    pub sort: Vec<SortField>,
    /// Pagination parameters.
    pub pagination: Pagination,
}

impl Query {
    /// Creates an empty query of the given type.
    #[must_use]
    pub fn new(query_type: impl Into<String>) -> Self {
        Self {
            query_type: query_type.into(),
            filters: HashMap::new(),
            sort: Vec::new(),
            pagination: Pagination::default(),
        }
    }

    /// Adds a single ascending/descending sort field, in priority order.
    #[must_use]
    pub fn with_sort(mut self, field: SortField) -> Self {
        self.sort.push(field);
        self
    }

    /// Validates that the query is well-formed enough to dispatch.
    ///
    /// # Errors
    /// Returns [`crate::error::ErrorCode::QueryValidation`] if `query_type`
    /// is empty.
    pub fn validate(&self) -> Result<()> {
        if self.query_type.trim().is_empty() {
            return Err(Error::new(
                crate::error::ErrorCode::QueryValidation,
                "query_type must not be empty",
            ));
        }
        Ok(())
    }
}

/// The outcome of dispatching a [`Query`]. Every failure is surfaced here,
/// never as a top-level `Err`, so callers have a single success check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Whether the query was handled without error.
    pub success: bool,
    /// The opaque result payload, when successful.
    pub data: Option<Value>,
    /// The failure, if any.
    pub error: Option<Error>,
    /// Total matches before pagination, when known.
    pub total_count: Option<u64>,
    /// The page number served, if pagination was page-based.
    pub page: Option<u32>,
    /// The page size served, if pagination was page-based.
    pub page_size: Option<u32>,
    /// Wall-clock time the dispatcher spent in the handler.
    pub execution_time: Duration,
}

impl QueryResult {
    /// Builds a successful result.
    #[must_use]
    pub fn ok(data: Value, total_count: Option<u64>, execution_time: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            total_count,
            page: None,
            page_size: None,
            execution_time,
        }
    }

    /// Builds a failed result wrapping `error`.
    #[must_use]
    pub fn failed(error: Error, execution_time: Duration) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            total_count: None,
            page: None,
            page_size: None,
            execution_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_resolves_page_to_offset_limit() {
        let p = Pagination {
            page: Some(3),
            page_size: Some(20),
            ..Default::default()
        };
        assert_eq!(p.resolve(), (40, Some(20)));
    }

    #[test]
    fn pagination_offset_limit_takes_precedence() {
        let p = Pagination {
            page: Some(3),
            page_size: Some(20),
            offset: Some(5),
            limit: Some(1),
        };
        assert_eq!(p.resolve(), (5, Some(1)));
    }

    #[test]
    fn validate_rejects_empty_query_type() {
        let q = Query::new("");
        assert!(q.validate().is_err());
    }

    #[test]
    fn multi_field_sort_preserves_priority_order() {
        let q = Query::new("ListAccounts")
            .with_sort(SortField::desc("balance"))
            .with_sort(SortField::asc("name"));
        assert_eq!(q.sort[0].field, "balance");
        assert_eq!(q.sort[1].field, "name");
    }
}
