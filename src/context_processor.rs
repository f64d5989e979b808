//! Vector-retrieved evidence for prompt construction.
//!
//! [`ContextProcessor::retrieve_context`] embeds the query once to make sure
//! the embedding backend is usable, then fans out to the log and metric
//! retrievers, merges their hits by relevance, and summarizes them.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use opsight_core::embedding::{embed_query, is_zero_vector, Embedder};
use opsight_core::error::ContextError;
use opsight_core::models::{ItemSource, RetrievalContext, RetrievalSummary, RetrievedItem, TimeRange};
use opsight_core::retrieval::{RetrieveOptions, Retriever};
use tracing::{debug, error, info};

use crate::cache::{CacheConfig, CacheStats, TtlCache};

#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    pub time_window: Option<Duration>,
    pub k: usize,
    pub min_relevance: f64,
    pub include_metrics: bool,
}

impl Default for RetrieveRequest {
    fn default() -> Self {
        Self {
            time_window: None,
            k: 5,
            min_relevance: 0.7,
            include_metrics: true,
        }
    }
}

pub struct ContextProcessor {
    embedder: Arc<dyn Embedder>,
    log_retriever: Arc<dyn Retriever>,
    metric_retriever: Option<Arc<dyn Retriever>>,
    cache: TtlCache<RetrievalContext>,
}

impl ContextProcessor {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        log_retriever: Arc<dyn Retriever>,
        metric_retriever: Option<Arc<dyn Retriever>>,
        cache_ttl: StdDuration,
        cache_max_size: usize,
    ) -> Self {
        Self {
            embedder,
            log_retriever,
            metric_retriever,
            cache: TtlCache::new(CacheConfig {
                default_ttl: Some(cache_ttl),
                max_size: cache_max_size,
            }),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Retrieve and summarize matching items. Results are cached per query and
    /// request, `min_relevance` included.
    pub async fn retrieve_context(&self, query: &str, request: &RetrieveRequest) -> RetrievalContext {
        let key = cache_key(query, request);
        if let Some(ctx) = self.cache.get(&key) {
            debug!(key = %key, "Returning cached retrieval context");
            return ctx;
        }

        if let Err(e) = self.check_embedding(query).await {
            error!(error = %e, "Skipping retrieval");
            return RetrievalContext::default();
        }

        let options = RetrieveOptions {
            time_window: request.time_window,
            k: request.k,
            min_relevance: request.min_relevance,
            ..Default::default()
        };

        let mut items = retrieve_or_empty(self.log_retriever.as_ref(), query, &options, "logs").await;

        if request.include_metrics {
            if let Some(retriever) = &self.metric_retriever {
                let metric_options = RetrieveOptions {
                    k: request.k / 2,
                    ..options.clone()
                };
                if metric_options.k > 0 {
                    items.extend(
                        retrieve_or_empty(retriever.as_ref(), query, &metric_options, "metrics").await,
                    );
                }
            }
        }

        let ctx = assemble(items);
        info!(
            logs = ctx.summary.log_count,
            metrics = ctx.summary.metric_count,
            "Retrieval context assembled"
        );
        self.cache.set(&key, ctx.clone(), None);
        ctx
    }

    async fn check_embedding(&self, query: &str) -> Result<(), ContextError> {
        let vector = embed_query(self.embedder.as_ref(), query)
            .await
            .map_err(|e| ContextError::EmbeddingFailure(e.to_string()))?;
        if vector.is_empty() || is_zero_vector(&vector) {
            return Err(ContextError::EmbeddingFailure(format!(
                "model '{}' returned an unusable vector",
                self.embedder.model_name()
            )));
        }
        Ok(())
    }
}

/// `context:query:window_secs|none:k:min_relevance:include_metrics`.
fn cache_key(query: &str, request: &RetrieveRequest) -> String {
    format!(
        "context:{}:{}:{}:{}:{}",
        query,
        request
            .time_window
            .map(|w| w.num_seconds().to_string())
            .unwrap_or_else(|| "none".to_string()),
        request.k,
        request.min_relevance,
        request.include_metrics
    )
}

async fn retrieve_or_empty(
    retriever: &dyn Retriever,
    query: &str,
    options: &RetrieveOptions,
    what: &str,
) -> Vec<RetrievedItem> {
    match retriever.retrieve(query, options).await {
        Ok(items) => items,
        Err(e) => {
            error!(retriever = what, error = %e, "Retriever failed");
            Vec::new()
        }
    }
}

/// Sort by relevance, split by source, and summarize.
pub fn assemble(mut items: Vec<RetrievedItem>) -> RetrievalContext {
    items.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let total_items = items.len();
    let avg_relevance = if total_items == 0 {
        0.0
    } else {
        items.iter().map(|i| i.relevance_score).sum::<f64>() / total_items as f64
    };
    let timestamps: Vec<_> = items.iter().filter_map(RetrievedItem::timestamp).collect();
    let timestamp_range = TimeRange {
        start: timestamps.iter().min().copied(),
        end: timestamps.iter().max().copied(),
    };

    let (logs, metrics): (Vec<_>, Vec<_>) = items
        .into_iter()
        .partition(|i| i.source == ItemSource::Log);

    RetrievalContext {
        summary: RetrievalSummary {
            total_items,
            log_count: logs.len(),
            metric_count: metrics.len(),
            avg_relevance,
            timestamp_range,
        },
        logs,
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use opsight_core::models::LogMessage;
    use opsight_core::retrieval::RetrieverMetadata;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct UnitEmbedder;

    #[async_trait]
    impl Embedder for UnitEmbedder {
        fn model_name(&self) -> &str {
            "unit"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    /// Serves fixed log hits, honouring `min_relevance`.
    struct FixedLogs {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Retriever for FixedLogs {
        async fn retrieve(
            &self,
            _query: &str,
            options: &RetrieveOptions,
        ) -> anyhow::Result<Vec<RetrievedItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok([("strong", 0.9), ("weak", 0.6)]
                .into_iter()
                .filter(|(_, score)| *score >= options.min_relevance)
                .map(|(id, score)| item(id, score, ItemSource::Log, None))
                .collect())
        }

        async fn metadata(&self) -> anyhow::Result<RetrieverMetadata> {
            Ok(RetrieverMetadata {
                name: "logs".into(),
                description: String::new(),
                total_items: 2,
                metric_types: None,
            })
        }
    }

    fn item(id: &str, score: f64, source: ItemSource, ts: Option<&str>) -> RetrievedItem {
        let mut metadata = Map::new();
        if let Some(ts) = ts {
            metadata.insert("timestamp".into(), json!(ts));
        }
        RetrievedItem {
            id: id.into(),
            content: LogMessage::RawText(id.into()),
            metadata,
            relevance_score: score,
            source,
            retrieved_at: Utc::now(),
            metric: None,
        }
    }

    #[test]
    fn test_assemble_sorts_and_summarizes() {
        let ctx = assemble(vec![
            item("l1", 0.75, ItemSource::Log, Some("2024-03-01T10:05:00Z")),
            item("m1", 0.95, ItemSource::Metric, Some("2024-03-01T10:00:00Z")),
            item("l2", 0.85, ItemSource::Log, None),
        ]);
        assert_eq!(ctx.summary.total_items, 3);
        assert_eq!(ctx.summary.log_count, 2);
        assert_eq!(ctx.summary.metric_count, 1);
        assert!((ctx.summary.avg_relevance - 0.85).abs() < 1e-9);
        assert_eq!(ctx.logs[0].id, "l2");
        assert_eq!(ctx.logs[1].id, "l1");
        assert_eq!(
            ctx.summary.timestamp_range.start.unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );
        assert_eq!(
            ctx.summary.timestamp_range.end.unwrap().to_rfc3339(),
            "2024-03-01T10:05:00+00:00"
        );
    }

    #[tokio::test]
    async fn test_stricter_threshold_is_not_served_from_cache() {
        let logs = Arc::new(FixedLogs {
            calls: AtomicUsize::new(0),
        });
        let processor = ContextProcessor::new(
            Arc::new(UnitEmbedder),
            logs.clone(),
            None,
            StdDuration::from_secs(60),
            10,
        );

        let loose = RetrieveRequest {
            min_relevance: 0.5,
            ..Default::default()
        };
        assert_eq!(processor.retrieve_context("disk", &loose).await.logs.len(), 2);

        let strict = RetrieveRequest {
            min_relevance: 0.8,
            ..Default::default()
        };
        let ctx = processor.retrieve_context("disk", &strict).await;
        let ids: Vec<&str> = ctx.logs.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["strong"]);
        assert_eq!(logs.calls.load(Ordering::SeqCst), 2);

        processor.retrieve_context("disk", &strict).await;
        assert_eq!(logs.calls.load(Ordering::SeqCst), 2);
        assert_eq!(processor.cache_stats().hits, 1);
    }

    #[test]
    fn test_assemble_empty() {
        let ctx = assemble(Vec::new());
        assert_eq!(ctx, RetrievalContext::default());
    }
}
