//! The read-model store (C12): denormalized query-side records, addressable
//! by id and queryable by a secondary type index.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::Result;

/// A denormalized projection record: `{id, type, version, data, last_updated}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadModel {
    /// The model's unique id (usually the source aggregate's id).
    pub id: String,
    /// The model's type name (the projection name).
    #[serde(rename = "type")]
    pub model_type: String,
    /// Monotonically increases on every update; used for optimistic writes.
    pub version: i64,
    /// The opaque, projection-defined payload.
    pub data: serde_json::Value,
    /// The timestamp of the last update.
    pub last_updated: DateTime<Utc>,
}

impl ReadModel {
    /// Creates a new read model at version 0.
    #[must_use]
    pub fn new(id: impl Into<String>, model_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            model_type: model_type.into(),
            version: 0,
            data,
            last_updated: Utc::now(),
        }
    }

    /// Replaces `data` and advances `version` and `last_updated`. Use this
    /// when the new data reflects a newer source version (e.g. a
    /// projection applying the next event in its stream).
    pub fn set_data(&mut self, data: serde_json::Value) {
        self.data = data;
        self.version += 1;
        self.last_updated = Utc::now();
    }

    /// Replaces `data` and bumps `last_updated` without advancing
    /// `version`. Use this for corrections that don't represent a new
    /// source version (e.g. a backfill or manual repair).
    pub fn update_data(&mut self, data: serde_json::Value) {
        self.data = data;
        self.last_updated = Utc::now();
    }
}

/// Criteria for [`ReadModelStore::query`]: models of `model_type` whose
/// `data` object has all of `field_equals` set to the given values.
#[derive(Debug, Clone, Default)]
pub struct QueryCriteria {
    /// Restricts to a single model type, if set.
    pub model_type: Option<String>,
    /// Exact-match filters over top-level fields of `data`.
    pub field_equals: HashMap<String, serde_json::Value>,
    /// Skips this many matches before returning results.
    pub offset: usize,
    /// Caps the number of returned results.
    pub limit: Option<usize>,
}

/// Persists, queries, and indexes denormalized read models.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    /// Saves (inserts or replaces) a single read model.
    async fn save(&self, model: ReadModel) -> Result<()>;

    /// Saves a batch of read models; not required to be atomic across the
    /// whole batch, only per-record.
    async fn save_batch(&self, models: Vec<ReadModel>) -> Result<()> {
        for model in models {
            self.save(model).await?;
        }
        Ok(())
    }

    /// Loads a single read model by id.
    async fn get(&self, id: &str) -> Result<Option<ReadModel>>;

    /// Deletes a single read model by id.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Deletes a batch of read models by id.
    async fn delete_batch(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.delete(id).await?;
        }
        Ok(())
    }

    /// Returns models matching `criteria`.
    async fn query(&self, criteria: &QueryCriteria) -> Result<Vec<ReadModel>>;

    /// Counts models matching `criteria`, without materializing them.
    async fn count(&self, criteria: &QueryCriteria) -> Result<u64> {
        Ok(self.query(criteria).await?.len() as u64)
    }
}

/// An in-memory read-model store, secondarily indexed by `model_type` for
/// fast [`ReadModelStore::query`] scoping.
#[derive(Default)]
pub struct InMemoryReadModelStore {
    models: Arc<DashMap<String, ReadModel>>,
    by_type: Arc<DashMap<String, Vec<String>>>,
}

impl InMemoryReadModelStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, model_type: &str, id: &str) {
        let mut ids = self.by_type.entry(model_type.to_string()).or_default();
        if !ids.contains(&id.to_string()) {
            ids.push(id.to_string());
        }
    }

    fn unindex(&self, model_type: &str, id: &str) {
        if let Some(mut ids) = self.by_type.get_mut(model_type) {
            ids.retain(|existing| existing != id);
        }
    }

    fn matches(model: &ReadModel, criteria: &QueryCriteria) -> bool {
        if let Some(model_type) = &criteria.model_type {
            if &model.model_type != model_type {
                return false;
            }
        }
        criteria.field_equals.iter().all(|(field, expected)| {
            model.data.get(field).is_some_and(|actual| actual == expected)
        })
    }
}

#[async_trait]
impl ReadModelStore for InMemoryReadModelStore {
    #[instrument(skip(self, model), fields(id = %model.id, model_type = %model.model_type))]
    async fn save(&self, model: ReadModel) -> Result<()> {
        if let Some(previous) = self.models.get(&model.id) {
            if previous.model_type != model.model_type {
                self.unindex(&previous.model_type, &model.id);
            }
        }
        self.index(&model.model_type, &model.id);
        self.models.insert(model.id.clone(), model);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ReadModel>> {
        Ok(self.models.get(id).map(|m| m.clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if let Some((_, model)) = self.models.remove(id) {
            self.unindex(&model.model_type, id);
        }
        Ok(())
    }

    async fn query(&self, criteria: &QueryCriteria) -> Result<Vec<ReadModel>> {
        let candidates: Vec<ReadModel> = match &criteria.model_type {
            Some(model_type) => self
                .by_type
                .get(model_type)
                .map(|ids| ids.iter().filter_map(|id| self.models.get(id).map(|m| m.clone())).collect())
                .unwrap_or_default(),
            None => self.models.iter().map(|r| r.clone()).collect(),
        };

        let filtered: Vec<ReadModel> = candidates
            .into_iter()
            .filter(|m| Self::matches(m, criteria))
            .skip(criteria.offset)
            .collect();

        Ok(match criteria.limit {
            Some(limit) => filtered.into_iter().take(limit).collect(),
            None => filtered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_scopes_by_type_and_field() {
        let store = InMemoryReadModelStore::new();
        store
            .save(ReadModel::new("a1", "Account", serde_json::json!({"owner": "alice"})))
            .await
            .unwrap();
        store
            .save(ReadModel::new("a2", "Account", serde_json::json!({"owner": "bob"})))
            .await
            .unwrap();
        store
            .save(ReadModel::new("o1", "Order", serde_json::json!({"owner": "alice"})))
            .await
            .unwrap();

        let mut criteria = QueryCriteria {
            model_type: Some("Account".into()),
            ..Default::default()
        };
        criteria.field_equals.insert("owner".into(), serde_json::json!("alice"));

        let results = store.query(&criteria).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a1");
    }

    #[test]
    fn set_data_increments_version_update_data_does_not() {
        let mut model = ReadModel::new("a1", "Account", serde_json::json!({"balance": 0}));
        assert_eq!(model.version, 0);

        model.set_data(serde_json::json!({"balance": 10}));
        assert_eq!(model.version, 1);
        assert_eq!(model.data, serde_json::json!({"balance": 10}));

        model.update_data(serde_json::json!({"balance": 11}));
        assert_eq!(model.version, 1);
        assert_eq!(model.data, serde_json::json!({"balance": 11}));
    }

    #[tokio::test]
    async fn delete_removes_from_index() {
        let store = InMemoryReadModelStore::new();
        store
            .save(ReadModel::new("a1", "Account", serde_json::json!({})))
            .await
            .unwrap();
        store.delete("a1").await.unwrap();

        let criteria = QueryCriteria {
            model_type: Some("Account".into()),
            ..Default::default()
        };
        assert!(store.query(&criteria).await.unwrap().is_empty());
    }
}
