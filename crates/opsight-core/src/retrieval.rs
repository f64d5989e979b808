//! Vector retrievers over log and metric collections.
//!
//! A retriever embeds the query, asks its [`VectorIndex`] for
//! neighbours, and converts distances into relevance scores:
//!
//! ```text
//! query ──▶ Embedder ──▶ VectorIndex::query(min(k*2, 20))
//!                              │
//!                              ▼
//!           relevance = 1 - distance/2, clamp [0, 1]
//!                              │
//!           drop < min_relevance, sort desc
//!                              │
//!           convert (metrics skip unparsable documents), take k
//! ```
//!
//! Embedding failures never surface as errors here: the query falls back
//! to a zero vector, whose neighbours all score 0.5 and are filtered out
//! under the default threshold.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::embedding::{embed_query_or_zero, Embedder};
use crate::index::{MetadataFilter, Neighbor, VectorIndex};
use crate::models::{ItemSource, LogMessage, MetricReading, RetrievedItem};
use crate::time_window::epoch_seconds;

/// Upper bound on neighbours requested from the index per query.
const MAX_FETCH: usize = 20;

/// Metadata key carrying a metric document's type.
const METRIC_TYPE_KEY: &str = "type";

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    /// Only consider documents newer than `now - time_window`. A window
    /// reaching past the representable range applies no time bound.
    pub time_window: Option<Duration>,
    pub k: usize,
    pub min_relevance: f64,
    /// Metric retriever only: restrict to documents whose `type` matches.
    pub metric_type: Option<String>,
    /// Extra exact-match metadata conditions.
    pub filters: BTreeMap<String, Value>,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            time_window: None,
            k: 5,
            min_relevance: 0.7,
            metric_type: None,
            filters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrieverMetadata {
    pub name: String,
    pub description: String,
    pub total_items: usize,
    /// Distinct `type` values stored in a metric collection, sorted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_types: Option<Vec<String>>,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, options: &RetrieveOptions) -> Result<Vec<RetrievedItem>>;

    async fn metadata(&self) -> Result<RetrieverMetadata>;

    /// Hook for re-syncing with the backing collection. No-op by default.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Map a cosine distance in `[0, 2]` to a relevance in `[0, 1]`.
pub fn distance_to_relevance(distance: f64) -> f64 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

fn build_filter(options: &RetrieveOptions, type_filter: Option<&str>) -> Option<MetadataFilter> {
    let mut filter = MetadataFilter {
        min_timestamp_epoch: options
            .time_window
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .map(epoch_seconds),
        equals: options.filters.clone(),
    };
    if let Some(t) = type_filter {
        filter
            .equals
            .insert(METRIC_TYPE_KEY.to_string(), Value::String(t.to_string()));
    }
    (!filter.is_empty()).then_some(filter)
}

/// Thresholded candidates, best first. Callers take `k` after conversion.
async fn nearest(
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
    query: &str,
    options: &RetrieveOptions,
    filter: Option<MetadataFilter>,
) -> Result<Vec<(Neighbor, f64)>> {
    let embedding = embed_query_or_zero(embedder, query).await;
    let fetch = (options.k * 2).min(MAX_FETCH);
    let neighbors = index.query(&embedding, fetch, filter.as_ref()).await?;

    let mut scored: Vec<(Neighbor, f64)> = neighbors
        .into_iter()
        .map(|n| {
            let relevance = distance_to_relevance(n.distance);
            (n, relevance)
        })
        .filter(|(_, r)| *r >= options.min_relevance)
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    debug!(index = index.name(), query, hits = scored.len(), "Vector retrieval");
    Ok(scored)
}

/// Semantic search over a collection of log lines.
pub struct LogRetriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl LogRetriever {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self { index, embedder }
    }
}

#[async_trait]
impl Retriever for LogRetriever {
    async fn retrieve(&self, query: &str, options: &RetrieveOptions) -> Result<Vec<RetrievedItem>> {
        let filter = build_filter(options, None);
        let hits = nearest(
            self.index.as_ref(),
            self.embedder.as_ref(),
            query,
            options,
            filter,
        )
        .await?;

        let now = Utc::now();
        Ok(hits
            .into_iter()
            .map(|(n, relevance)| RetrievedItem {
                id: n.id,
                content: LogMessage::from_body(&n.document),
                metadata: n.metadata,
                relevance_score: relevance,
                source: ItemSource::Log,
                retrieved_at: now,
                metric: None,
            })
            .take(options.k)
            .collect())
    }

    async fn metadata(&self) -> Result<RetrieverMetadata> {
        Ok(RetrieverMetadata {
            name: self.index.name().to_string(),
            description: self.index.description().to_string(),
            total_items: self.index.count().await?,
            metric_types: None,
        })
    }
}

/// Semantic search over a collection of metric readings.
///
/// Documents are JSON objects `{"name", "value", "unit"}`.
pub struct MetricRetriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl MetricRetriever {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self { index, embedder }
    }
}

#[async_trait]
impl Retriever for MetricRetriever {
    async fn retrieve(&self, query: &str, options: &RetrieveOptions) -> Result<Vec<RetrievedItem>> {
        let filter = build_filter(options, options.metric_type.as_deref());
        let hits = nearest(
            self.index.as_ref(),
            self.embedder.as_ref(),
            query,
            options,
            filter,
        )
        .await?;

        let now = Utc::now();
        let mut items = Vec::with_capacity(options.k);
        for (n, relevance) in hits {
            if items.len() == options.k {
                break;
            }
            let reading: MetricReading = match serde_json::from_str(&n.document) {
                Ok(r) => r,
                Err(e) => {
                    error!(id = %n.id, error = %e, "Skipping unparsable metric document");
                    continue;
                }
            };
            items.push(RetrievedItem {
                id: n.id,
                content: LogMessage::from_body(&n.document),
                metadata: n.metadata,
                relevance_score: relevance,
                source: ItemSource::Metric,
                retrieved_at: now,
                metric: Some(reading),
            });
        }
        Ok(items)
    }

    async fn metadata(&self) -> Result<RetrieverMetadata> {
        Ok(RetrieverMetadata {
            name: self.index.name().to_string(),
            description: self.index.description().to_string(),
            total_items: self.index.count().await?,
            metric_types: Some(self.index.metadata_values(METRIC_TYPE_KEY).await?),
        })
    }
}
