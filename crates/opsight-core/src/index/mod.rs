//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the read side of a nearest-neighbour
//! store: the retrievers hand it a query embedding and an optional
//! metadata filter and get back the closest documents with their
//! distances. The app crate implements it over Chroma's REST API;
//! [`memory::InMemoryIndex`] backs tests.
//!
//! Distances are cosine distances in `[0, 2]` (0 = identical).

pub mod memory;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

/// Metadata key holding a document's timestamp as epoch seconds.
pub const TIMESTAMP_EPOCH_KEY: &str = "timestamp_epoch";

/// A nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub distance: f64,
    pub document: String,
    pub metadata: Map<String, Value>,
}

/// Conjunction of metadata conditions applied by the index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    /// Keep documents whose `timestamp_epoch` is at least this value.
    pub min_timestamp_epoch: Option<f64>,
    /// Exact-match conditions.
    pub equals: BTreeMap<String, Value>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.min_timestamp_epoch.is_none() && self.equals.is_empty()
    }

    pub fn with_equals(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    /// Render as a Chroma `where` clause. `None` when there is nothing to
    /// filter on.
    pub fn to_where(&self) -> Option<Value> {
        let mut clauses: Vec<Value> = self
            .equals
            .iter()
            .map(|(k, v)| json!({ k: v }))
            .collect();
        if let Some(min) = self.min_timestamp_epoch {
            clauses.push(json!({ TIMESTAMP_EPOCH_KEY: { "$gte": min } }));
        }
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(json!({ "$and": clauses })),
        }
    }

    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        if let Some(min) = self.min_timestamp_epoch {
            match metadata.get(TIMESTAMP_EPOCH_KEY).and_then(Value::as_f64) {
                Some(ts) if ts >= min => {}
                _ => return false,
            }
        }
        self.equals
            .iter()
            .all(|(k, v)| metadata.get(k) == Some(v))
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Collection name, used in logs.
    fn name(&self) -> &str;

    /// Human-readable description of what the collection holds.
    fn description(&self) -> &str;

    /// Return up to `n` neighbours of `embedding`, closest first.
    async fn query(
        &self,
        embedding: &[f32],
        n: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Neighbor>>;

    /// Number of documents in the collection.
    async fn count(&self) -> Result<usize>;

    /// Distinct string values stored under metadata `key`, sorted.
    async fn metadata_values(&self, key: &str) -> Result<Vec<String>>;
}

/// Sorted, deduplicated string values of `key` across `metadatas`.
pub fn distinct_values<'a>(
    metadatas: impl IntoIterator<Item = &'a Map<String, Value>>,
    key: &str,
) -> Vec<String> {
    let values: BTreeSet<String> = metadatas
        .into_iter()
        .filter_map(|m| m.get(key).and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    values.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_clause_shapes() {
        assert_eq!(MetadataFilter::default().to_where(), None);

        let single = MetadataFilter::default().with_equals("metric_type", "cpu_usage");
        assert_eq!(single.to_where(), Some(json!({"metric_type": "cpu_usage"})));

        let both = MetadataFilter {
            min_timestamp_epoch: Some(100.0),
            ..single
        };
        assert_eq!(
            both.to_where(),
            Some(json!({"$and": [
                {"metric_type": "cpu_usage"},
                {"timestamp_epoch": {"$gte": 100.0}}
            ]}))
        );
    }

    #[test]
    fn test_filter_matches() {
        let filter = MetadataFilter {
            min_timestamp_epoch: Some(100.0),
            ..Default::default()
        }
        .with_equals("service", "api");

        let mut meta = Map::new();
        meta.insert("service".into(), json!("api"));
        meta.insert("timestamp_epoch".into(), json!(150));
        assert!(filter.matches(&meta));

        meta.insert("timestamp_epoch".into(), json!(50));
        assert!(!filter.matches(&meta));

        meta.remove("timestamp_epoch");
        assert!(!filter.matches(&meta));
    }

    #[test]
    fn test_distinct_values_skips_missing_and_non_strings() {
        let metas: Vec<Map<String, Value>> = [
            json!({"type": "memory_usage"}),
            json!({"type": "cpu_usage"}),
            json!({"type": "cpu_usage"}),
            json!({"type": 3}),
            json!({}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
        assert_eq!(distinct_values(&metas, "type"), vec!["cpu_usage", "memory_usage"]);
    }
}
