//! Analysis context assembly.
//!
//! The [`ContextManager`] turns a free-text query and a time window into a
//! [`ContextDocument`]:
//!
//! ```text
//! resolve + validate window ──▶ cache lookup ──hit──▶ return
//!                                   │ miss
//!                                   ▼
//!        ┌──────────── tokio::join! ────────────┐
//!        │ logs        metrics        events    │   each fetcher degrades
//!        └──────────────────┬───────────────────┘   to an empty result
//!                           ▼
//!           merge (logs → metrics → events)
//!                           ▼
//!           correlation engine (optional) ──▶ cache ──▶ return
//! ```
//!
//! Windows ending now are cached by their length; explicit bounds are
//! cached by the bounds themselves.
//!
//! No failure reaches the caller as an error: an invalid window, a
//! timeout, or an unexpected fault all produce the canonical empty
//! document with its `error` field set.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use opsight_core::classify::{
    detect_metric_type, event_line_filters, event_stats, metric_stats, metrics_from_items,
    metrics_from_logs, to_events,
};
use opsight_core::correlation::{CorrelationConfig, CorrelationEngine};
use opsight_core::error::ContextError;
use opsight_core::models::{
    ContextDocument, ContextMetadata, ContextType, EventRecord, EventStats, LogEntry, LogStats,
    MetricPoint, MetricSummary,
};
use opsight_core::retrieval::{RetrieveOptions, Retriever};
use opsight_core::time_window::TimeWindowResolver;
use tracing::{error, info, instrument, warn};

use crate::cache::{CacheConfig, CacheStats, SweepHandle, TtlCache};
use crate::config::{ContextConfig, RetrievalConfig};
use crate::log_source::{LogFilter, LogSource};

#[derive(Debug, Clone)]
pub struct ContextManagerConfig {
    pub max_logs: usize,
    pub max_metrics: usize,
    pub metric_k: usize,
    pub metric_min_relevance: f64,
    pub cache_ttl: StdDuration,
    pub cache_max_size: usize,
    pub sweep_interval: StdDuration,
    pub correlation_window: Duration,
    pub include_raw_data: bool,
    pub default_window: Duration,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default(), &RetrievalConfig::default())
    }
}

impl ContextManagerConfig {
    pub fn from_config(context: &ContextConfig, retrieval: &RetrievalConfig) -> Self {
        Self {
            max_logs: context.max_logs,
            max_metrics: context.max_metrics,
            metric_k: context.metric_k,
            metric_min_relevance: retrieval.min_relevance,
            cache_ttl: StdDuration::from_secs(context.cache_ttl_secs),
            cache_max_size: context.cache_max_size,
            sweep_interval: StdDuration::from_secs(context.sweep_interval_secs),
            correlation_window: Duration::seconds(context.correlation_window_secs as i64),
            include_raw_data: context.include_raw_data,
            default_window: Duration::seconds(context.default_window_secs as i64),
        }
    }
}

pub struct ContextManager {
    log_source: Arc<dyn LogSource>,
    metric_retriever: Option<Arc<dyn Retriever>>,
    cache: Arc<TtlCache<ContextDocument>>,
    sweeper: Mutex<Option<SweepHandle>>,
    engine: CorrelationEngine,
    resolver: TimeWindowResolver,
    config: ContextManagerConfig,
}

impl ContextManager {
    pub fn new(log_source: Arc<dyn LogSource>, config: ContextManagerConfig) -> Self {
        let cache = Arc::new(TtlCache::new(CacheConfig {
            default_ttl: Some(config.cache_ttl),
            max_size: config.cache_max_size,
        }));
        let engine = CorrelationEngine::new(CorrelationConfig {
            correlation_window: config.correlation_window,
            ..Default::default()
        });
        Self {
            log_source,
            metric_retriever: None,
            cache,
            sweeper: Mutex::new(None),
            engine,
            resolver: TimeWindowResolver::new(config.default_window),
            config,
        }
    }

    /// Read metrics from a vector index instead of metric-labelled log lines.
    pub fn with_metric_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.metric_retriever = Some(retriever);
        self
    }

    /// Start purging expired cache entries in the background. Must be
    /// called from within a tokio runtime.
    pub fn start_sweeper(&self) {
        let handle = self.cache.spawn_sweeper(self.config.sweep_interval);
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(handle);
    }

    /// Stop the background sweep, if running.
    pub async fn shutdown(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn resolver(&self) -> &TimeWindowResolver {
        &self.resolver
    }

    /// Build (or fetch from cache) the context for the window ending now.
    ///
    /// Cached by window length, not by the resolved bounds.
    #[instrument(skip(self, context_types))]
    pub async fn get_analysis_context(
        &self,
        query: &str,
        time_window: Option<Duration>,
        context_types: Option<&[ContextType]>,
        include_correlations: bool,
    ) -> ContextDocument {
        let (start, end) = match self.resolver.resolve(time_window, None, None) {
            Ok(bounds) => bounds,
            Err(reason) => {
                error!(?time_window, %reason, "Invalid time range");
                return ContextDocument::failed(ContextError::from(reason).to_string());
            }
        };
        let length = time_window.unwrap_or(self.resolver.default_window());
        let key = relative_cache_key(query, length, context_types);
        self.assemble(key, query, start, end, context_types, include_correlations)
            .await
    }

    /// As [`get_analysis_context`](Self::get_analysis_context), bounded by a
    /// deadline. On expiry the in-flight work is dropped, nothing is cached,
    /// and the empty document is returned.
    pub async fn get_analysis_context_within(
        &self,
        deadline: StdDuration,
        query: &str,
        time_window: Option<Duration>,
        context_types: Option<&[ContextType]>,
        include_correlations: bool,
    ) -> ContextDocument {
        let work = self.get_analysis_context(query, time_window, context_types, include_correlations);
        match tokio::time::timeout(deadline, work).await {
            Ok(doc) => doc,
            Err(_) => {
                warn!(query, deadline_ms = deadline.as_millis() as u64, "Context assembly timed out");
                ContextDocument::failed(format!(
                    "context assembly exceeded deadline of {}ms",
                    deadline.as_millis()
                ))
            }
        }
    }

    /// Build (or fetch from cache) the context for explicit bounds.
    #[instrument(skip(self, context_types))]
    pub async fn get_analysis_context_between(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        context_types: Option<&[ContextType]>,
        include_correlations: bool,
    ) -> ContextDocument {
        let key = cache_key(query, start, end, context_types);
        self.assemble(key, query, start, end, context_types, include_correlations)
            .await
    }

    async fn assemble(
        &self,
        key: String,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        context_types: Option<&[ContextType]>,
        include_correlations: bool,
    ) -> ContextDocument {
        let window = match self.resolver.check(start, end) {
            Ok(w) => w,
            Err(reason) => {
                error!(%start, %end, %reason, "Invalid time range");
                return ContextDocument::failed(ContextError::from(reason).to_string());
            }
        };

        if let Some(doc) = self.cache.get(&key) {
            info!(key = %key, "Returning cached context");
            return doc;
        }

        let selected = context_types.unwrap_or(&ContextType::ALL[..]);
        let wants = |t: ContextType| selected.contains(&t);

        let (logs, metrics, events) = tokio::join!(
            async {
                if wants(ContextType::Logs) {
                    Some(self.fetch_logs(start, end).await)
                } else {
                    None
                }
            },
            async {
                if wants(ContextType::Metrics) {
                    Some(self.fetch_metrics(query, start, end).await)
                } else {
                    None
                }
            },
            async {
                if wants(ContextType::Events) {
                    Some(self.fetch_events(query, start, end).await)
                } else {
                    None
                }
            },
        );

        let mut doc = ContextDocument::new(ContextMetadata {
            context_id: uuid::Uuid::new_v4(),
            query: query.to_string(),
            start_time: start,
            end_time: end,
            types: context_types.map(<[ContextType]>::to_vec),
            time_range_label: window.human_label(),
        });
        if let Some((entries, stats)) = logs {
            doc.logs = entries;
            doc.log_stats = stats;
        }
        if let Some((points, stats)) = metrics {
            doc.metrics = points;
            doc.metric_stats = stats;
        }
        if let Some((records, stats)) = events {
            doc.events = records;
            doc.event_stats = stats;
        }

        if include_correlations {
            doc.correlations = Some(self.engine.analyze(&doc));
        }

        info!(
            logs = doc.logs.len(),
            metrics = doc.metrics.len(),
            events = doc.events.len(),
            "Context assembled"
        );
        self.cache.set(&key, doc.clone(), None);
        doc
    }

    async fn fetch_logs(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> (Vec<LogEntry>, LogStats) {
        match self
            .log_source
            .query(start, end, None, self.config.max_logs)
            .await
        {
            Ok(result) => (result.entries, result.stats),
            Err(e) => {
                error!(error = %ContextError::from(e), "Error getting logs context");
                Default::default()
            }
        }
    }

    async fn fetch_metrics(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> (Vec<MetricPoint>, BTreeMap<String, MetricSummary>) {
        let metric_type = detect_metric_type(query);

        let points = if let Some(retriever) = &self.metric_retriever {
            let options = RetrieveOptions {
                time_window: Some(end - start),
                k: self.config.metric_k,
                min_relevance: self.config.metric_min_relevance,
                metric_type: metric_type.map(str::to_string),
                ..Default::default()
            };
            match retriever.retrieve(query, &options).await {
                Ok(items) => metrics_from_items(&items),
                Err(e) => {
                    error!(error = %e, "Error getting metrics context");
                    Vec::new()
                }
            }
        } else {
            let filter = metric_type.map(|m| LogFilter::MetricName(m.to_string()));
            match self
                .log_source
                .query(start, end, filter.as_ref(), self.config.max_metrics)
                .await
            {
                Ok(result) => metrics_from_logs(&result.entries),
                Err(e) => {
                    error!(error = %ContextError::from(e), "Error getting metrics context");
                    Vec::new()
                }
            }
        };

        let stats = metric_stats(&points);
        (points, stats)
    }

    async fn fetch_events(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> (Vec<EventRecord>, EventStats) {
        let filter = LogFilter::LineMatch(event_line_filters(query));
        match self
            .log_source
            .query(start, end, Some(&filter), self.config.max_logs)
            .await
        {
            Ok(result) => {
                let events = to_events(&result.entries, self.config.include_raw_data);
                let stats = event_stats(&events);
                (events, stats)
            }
            Err(e) => {
                error!(error = %ContextError::from(e), "Error getting events context");
                Default::default()
            }
        }
    }
}

/// `query:start_iso:end_iso:types`, with types sorted and deduplicated.
pub fn cache_key(
    query: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    context_types: Option<&[ContextType]>,
) -> String {
    format!(
        "{}:{}:{}:{}",
        query,
        start.to_rfc3339(),
        end.to_rfc3339(),
        types_key(context_types)
    )
}

/// `query:last=<seconds>s:types`, for windows ending now.
pub fn relative_cache_key(
    query: &str,
    window: Duration,
    context_types: Option<&[ContextType]>,
) -> String {
    format!(
        "{}:last={}s:{}",
        query,
        window.num_seconds(),
        types_key(context_types)
    )
}

fn types_key(context_types: Option<&[ContextType]>) -> String {
    match context_types {
        None => "all".to_string(),
        Some(types) => {
            let mut names: Vec<&str> = types.iter().map(ContextType::as_str).collect();
            names.sort_unstable();
            names.dedup();
            names.join(",")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cache_key_sorts_types() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let a = cache_key(
            "cpu",
            start,
            end,
            Some(&[ContextType::Metrics, ContextType::Logs]),
        );
        let b = cache_key(
            "cpu",
            start,
            end,
            Some(&[ContextType::Logs, ContextType::Metrics, ContextType::Logs]),
        );
        assert_eq!(a, b);
        assert_eq!(
            a,
            "cpu:2024-03-01T10:00:00+00:00:2024-03-01T11:00:00+00:00:logs,metrics"
        );
        assert!(cache_key("cpu", start, end, None).ends_with(":all"));
    }

    #[test]
    fn test_relative_cache_key_ignores_clock() {
        let key = relative_cache_key(
            "cpu",
            Duration::hours(1),
            Some(&[ContextType::Metrics, ContextType::Logs]),
        );
        assert_eq!(key, "cpu:last=3600s:logs,metrics");
        assert_ne!(
            relative_cache_key("cpu", Duration::hours(1), None),
            relative_cache_key("cpu", Duration::hours(2), None)
        );
    }

    #[test]
    fn test_config_conversion() {
        let cfg = ContextManagerConfig::default();
        assert_eq!(cfg.correlation_window, Duration::minutes(30));
        assert_eq!(cfg.default_window, Duration::hours(1));
        assert_eq!(cfg.cache_ttl, StdDuration::from_secs(300));
        assert_eq!(cfg.metric_min_relevance, 0.7);
    }
}
