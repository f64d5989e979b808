//! [`VectorIndex`] over Chroma's REST API (v1).
//!
//! The collection is resolved lazily on first use with `get_or_create`,
//! so a fresh Chroma instance works without a separate setup step.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | resolve | `POST /api/v1/collections` `{name, get_or_create: true}` |
//! | query | `POST /api/v1/collections/{id}/query` |
//! | count | `GET /api/v1/collections/{id}/count` |
//! | metadata values | `POST /api/v1/collections/{id}/get` `{include: ["metadatas"]}` |

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use opsight_core::index::{distinct_values, MetadataFilter, Neighbor, VectorIndex};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

pub struct ChromaIndex {
    base_url: String,
    name: String,
    description: String,
    client: reqwest::Client,
    collection_id: OnceCell<String>,
}

#[derive(Deserialize)]
struct CollectionResponse {
    id: String,
}

/// Chroma returns one list per query embedding; we always send one.
#[derive(Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Map<String, Value>>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f64>>>,
}

#[derive(Deserialize, Default)]
struct GetResponse {
    #[serde(default)]
    metadatas: Vec<Option<Map<String, Value>>>,
}

impl ChromaIndex {
    pub fn new(
        base_url: &str,
        name: impl Into<String>,
        description: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            name: name.into(),
            description: description.into(),
            client,
            collection_id: OnceCell::new(),
        })
    }

    async fn collection_id(&self) -> Result<&str> {
        let id = self
            .collection_id
            .get_or_try_init(|| async {
                let url = format!("{}/api/v1/collections", self.base_url);
                let response = self
                    .client
                    .post(&url)
                    .json(&json!({
                        "name": self.name,
                        "get_or_create": true,
                        "metadata": {"description": self.description, "hnsw:space": "cosine"},
                    }))
                    .send()
                    .await
                    .with_context(|| format!("Failed to reach Chroma at {}", self.base_url))?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    bail!("Chroma collection '{}' error {}: {}", self.name, status, body);
                }
                let collection: CollectionResponse = response.json().await?;
                debug!(collection = %self.name, id = %collection.id, "Resolved Chroma collection");
                Ok(collection.id)
            })
            .await?;
        Ok(id.as_str())
    }
}

#[async_trait]
impl VectorIndex for ChromaIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    #[instrument(skip(self, embedding, filter), fields(collection = %self.name))]
    async fn query(
        &self,
        embedding: &[f32],
        n: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Neighbor>> {
        let id = self.collection_id().await?;
        let url = format!("{}/api/v1/collections/{}/query", self.base_url, id);

        let mut body = json!({
            "query_embeddings": [embedding],
            "n_results": n,
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(clause) = filter.and_then(MetadataFilter::to_where) {
            body["where"] = clause;
        }

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Chroma query error {}: {}", status, text);
        }
        let parsed: QueryResponse = response.json().await?;
        Ok(flatten_query_response(parsed))
    }

    async fn count(&self) -> Result<usize> {
        let id = self.collection_id().await?;
        let url = format!("{}/api/v1/collections/{}/count", self.base_url, id);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Chroma count error {}: {}", status, text);
        }
        Ok(response.json::<usize>().await?)
    }

    async fn metadata_values(&self, key: &str) -> Result<Vec<String>> {
        let id = self.collection_id().await?;
        let url = format!("{}/api/v1/collections/{}/get", self.base_url, id);
        let response = self
            .client
            .post(&url)
            .json(&json!({"include": ["metadatas"]}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Chroma get error {}: {}", status, text);
        }
        let parsed: GetResponse = response.json().await?;
        Ok(distinct_values(parsed.metadatas.iter().flatten(), key))
    }
}

fn flatten_query_response(resp: QueryResponse) -> Vec<Neighbor> {
    let ids = resp.ids.into_iter().next().unwrap_or_default();
    let mut documents = resp
        .documents
        .and_then(|d| d.into_iter().next())
        .unwrap_or_default()
        .into_iter();
    let mut metadatas = resp
        .metadatas
        .and_then(|m| m.into_iter().next())
        .unwrap_or_default()
        .into_iter();
    let mut distances = resp
        .distances
        .and_then(|d| d.into_iter().next())
        .unwrap_or_default()
        .into_iter();

    ids.into_iter()
        .map(|id| Neighbor {
            id,
            document: documents.next().flatten().unwrap_or_default(),
            metadata: metadatas.next().flatten().unwrap_or_default(),
            distance: distances.next().unwrap_or(2.0),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_query_response() {
        let resp: QueryResponse = serde_json::from_value(json!({
            "ids": [["a", "b"]],
            "documents": [["error: disk full", null]],
            "metadatas": [[{"service": "api"}, null]],
            "distances": [[0.1, 0.4]],
        }))
        .unwrap();
        let hits = flatten_query_response(resp);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document, "error: disk full");
        assert_eq!(hits[0].metadata["service"], "api");
        assert_eq!(hits[1].document, "");
        assert!(hits[1].metadata.is_empty());
        assert_eq!(hits[1].distance, 0.4);
    }

    #[test]
    fn test_flatten_missing_distances_scores_as_unrelated() {
        let resp: QueryResponse = serde_json::from_value(json!({"ids": [["a"]]})).unwrap();
        let hits = flatten_query_response(resp);
        assert_eq!(hits[0].distance, 2.0);
    }

    #[test]
    fn test_flatten_empty() {
        assert!(flatten_query_response(QueryResponse::default()).is_empty());
    }
}
