//! In-memory [`VectorIndex`] for tests and offline runs.
//!
//! Vectors live in a `Vec` behind `std::sync::RwLock`. Queries are
//! brute-force cosine distance over every stored vector.

use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{distinct_values, MetadataFilter, Neighbor, VectorIndex};
use crate::embedding::cosine_similarity;

struct StoredVector {
    id: String,
    vector: Vec<f32>,
    document: String,
    metadata: Map<String, Value>,
}

pub struct InMemoryIndex {
    name: String,
    description: String,
    vectors: RwLock<Vec<StoredVector>>,
}

impl InMemoryIndex {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            vectors: RwLock::new(Vec::new()),
        }
    }

    /// Insert or replace a document by id.
    pub fn add(
        &self,
        id: impl Into<String>,
        vector: Vec<f32>,
        document: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<()> {
        let id = id.into();
        let mut vectors = self
            .vectors
            .write()
            .map_err(|_| anyhow!("index '{}' lock poisoned", self.name))?;
        vectors.retain(|v| v.id != id);
        vectors.push(StoredVector {
            id,
            vector,
            document: document.into(),
            metadata,
        });
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn query(
        &self,
        embedding: &[f32],
        n: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Neighbor>> {
        let vectors = self
            .vectors
            .read()
            .map_err(|_| anyhow!("index '{}' lock poisoned", self.name))?;

        let mut hits: Vec<Neighbor> = vectors
            .iter()
            .filter(|v| filter.map_or(true, |f| f.matches(&v.metadata)))
            .map(|v| Neighbor {
                id: v.id.clone(),
                distance: f64::from(1.0 - cosine_similarity(embedding, &v.vector)),
                document: v.document.clone(),
                metadata: v.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(n);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        let vectors = self
            .vectors
            .read()
            .map_err(|_| anyhow!("index '{}' lock poisoned", self.name))?;
        Ok(vectors.len())
    }

    async fn metadata_values(&self, key: &str) -> Result<Vec<String>> {
        let vectors = self
            .vectors
            .read()
            .map_err(|_| anyhow!("index '{}' lock poisoned", self.name))?;
        Ok(distinct_values(vectors.iter().map(|v| &v.metadata), key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(service: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("service".into(), json!(service));
        m
    }

    #[tokio::test]
    async fn test_query_orders_by_distance() {
        let index = InMemoryIndex::new("logs", "test logs");
        index.add("a", vec![1.0, 0.0], "alpha", meta("api")).unwrap();
        index.add("b", vec![0.0, 1.0], "beta", meta("api")).unwrap();
        index.add("c", vec![0.9, 0.1], "gamma", meta("db")).unwrap();

        let hits = index.query(&[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].distance.abs() < 1e-6);
        assert_eq!(hits[1].id, "c");
    }

    #[tokio::test]
    async fn test_query_applies_filter() {
        let index = InMemoryIndex::new("logs", "test logs");
        index.add("a", vec![1.0, 0.0], "alpha", meta("api")).unwrap();
        index.add("c", vec![0.9, 0.1], "gamma", meta("db")).unwrap();

        let filter = MetadataFilter::default().with_equals("service", "db");
        let hits = index.query(&[1.0, 0.0], 10, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document, "gamma");
    }

    #[tokio::test]
    async fn test_add_replaces_by_id() {
        let index = InMemoryIndex::new("logs", "");
        index.add("a", vec![1.0], "one", Map::new()).unwrap();
        index.add("a", vec![1.0], "two", Map::new()).unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
    }
}
