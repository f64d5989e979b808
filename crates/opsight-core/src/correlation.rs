//! Cross-source correlation engine.
//!
//! Runs five independent analyses over an assembled context:
//!
//! 1. **Metric correlation**: Pearson coefficient for every pair of metric
//!    series, aligned on exact timestamps; kept when `|r| > significance`.
//! 2. **Log patterns**: error categories, per-hour volume, per-component
//!    error/warning counts.
//! 3. **Event-metric links**: metric samples within `correlation_window`
//!    of an event.
//! 4. **Event sequences**: three-event type sequences that repeat.
//! 5. **Event clusters**: events grouped by `(type, source)`.
//!
//! Each analysis is isolated: if one fails, it is logged and contributes an
//! empty result while the others still run.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::error;

use crate::classify::categorize_error;
use crate::error::{ContextError, Result};
use crate::models::{
    ContextDocument, CorrelationResult, Correlations, EventCluster, EventCorrelations,
    EventMetricLink, EventRecord, EventSequence, EventType, LogEntry, LogPatterns, MetricPoint,
    TimeRange,
};

/// Tuning for the correlation engine.
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    /// Maximum distance between an event and a metric sample to link them.
    pub correlation_window: Duration,
    /// Minimum `|r|` (exclusive) for a metric pair to be reported.
    pub significance: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            correlation_window: Duration::minutes(30),
            significance: 0.7,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorrelationEngine {
    config: CorrelationConfig,
}

impl CorrelationEngine {
    pub fn new(config: CorrelationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Run every analysis over the document's logs, metrics, and events.
    pub fn analyze(&self, doc: &ContextDocument) -> Correlations {
        let metric_correlations = if doc.metrics.is_empty() {
            BTreeMap::new()
        } else {
            isolated("metric_correlations", self.metric_correlations(&doc.metrics))
        };

        let log_patterns = if doc.logs.is_empty() {
            LogPatterns::default()
        } else {
            isolated("log_patterns", Ok(log_patterns(&doc.logs)))
        };

        let event_correlations = if doc.events.is_empty() {
            EventCorrelations::default()
        } else {
            EventCorrelations {
                event_metric_correlations: isolated(
                    "event_metric_correlations",
                    self.event_metric_links(&doc.events, &doc.metrics),
                ),
                event_sequences: isolated("event_sequences", Ok(event_sequences(&doc.events))),
                event_clusters: isolated("event_clusters", Ok(event_clusters(&doc.events))),
            }
        };

        Correlations {
            metric_correlations,
            log_patterns,
            event_correlations,
        }
    }

    /// Significant pairwise correlations keyed `"{a}_vs_{b}"`.
    ///
    /// Series are grouped by metric name in first-seen order; each unordered
    /// pair is aligned on identical timestamps.
    pub fn metric_correlations(
        &self,
        metrics: &[MetricPoint],
    ) -> Result<BTreeMap<String, CorrelationResult>> {
        if let Some(bad) = metrics.iter().find(|m| !m.value.is_finite()) {
            return Err(ContextError::correlation(
                "metric_correlations",
                format!("non-finite value {} in series '{}'", bad.value, bad.name),
            ));
        }

        let mut order: Vec<&str> = Vec::new();
        let mut series: HashMap<&str, BTreeMap<DateTime<Utc>, f64>> = HashMap::new();
        for m in metrics {
            let points = series.entry(m.name.as_str()).or_insert_with(|| {
                order.push(m.name.as_str());
                BTreeMap::new()
            });
            points.insert(m.timestamp, m.value);
        }

        let mut out = BTreeMap::new();
        for (i, a) in order.iter().enumerate() {
            for b in &order[i + 1..] {
                let result = correlate_series(&series[a], &series[b]);
                if result.coefficient.abs() > self.config.significance {
                    out.insert(format!("{}_vs_{}", a, b), result);
                }
            }
        }
        Ok(out)
    }

    /// Every (metric, event) pair closer than the correlation window.
    pub fn event_metric_links(
        &self,
        events: &[EventRecord],
        metrics: &[MetricPoint],
    ) -> Result<Vec<EventMetricLink>> {
        if self.config.correlation_window < Duration::zero() {
            return Err(ContextError::correlation(
                "event_metric_correlations",
                "correlation window is negative",
            ));
        }
        let window = self.config.correlation_window;
        let mut links = Vec::new();
        for metric in metrics {
            for event in events {
                let delta = (metric.timestamp - event.timestamp).abs();
                if delta <= window {
                    links.push(EventMetricLink {
                        event_type: event.event_type,
                        metric: metric.name.clone(),
                        time_diff_secs: delta.num_milliseconds() as f64 / 1000.0,
                        metric_value: metric.value,
                    });
                }
            }
        }
        Ok(links)
    }
}

fn isolated<T: Default>(analysis: &str, result: Result<T>) -> T {
    result.unwrap_or_else(|e| {
        error!(analysis, error = %e, "Correlation analysis failed");
        T::default()
    })
}

/// Pearson correlation coefficient.
///
/// Returns `None` with fewer than two samples, mismatched lengths, or when
/// either series has zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return None;
    }
    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}

/// Align two series on shared timestamps and correlate them. Undefined
/// correlations come back with a coefficient of `0.0`.
pub fn correlate_series(
    a: &BTreeMap<DateTime<Utc>, f64>,
    b: &BTreeMap<DateTime<Utc>, f64>,
) -> CorrelationResult {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut shared = Vec::new();
    for (ts, va) in a {
        if let Some(vb) = b.get(ts) {
            xs.push(*va);
            ys.push(*vb);
            shared.push(*ts);
        }
    }
    CorrelationResult {
        coefficient: pearson(&xs, &ys).unwrap_or(0.0),
        sample_size: xs.len(),
        time_range: TimeRange {
            start: shared.first().copied(),
            end: shared.last().copied(),
        },
    }
}

pub fn log_patterns(logs: &[LogEntry]) -> LogPatterns {
    let mut patterns = LogPatterns::default();
    for log in logs {
        let text = log.message.lowercase();
        let is_error = text.contains("error");

        if is_error {
            *patterns
                .error_patterns
                .entry(categorize_error(&text))
                .or_default() += 1;
        }

        *patterns
            .temporal_patterns
            .entry(log.timestamp.hour())
            .or_default() += 1;

        let component = log.label("component").unwrap_or("unknown").to_string();
        let stats = patterns.component_patterns.entry(component).or_default();
        stats.count += 1;
        if is_error {
            stats.error_count += 1;
        } else if text.contains("warning") {
            stats.warning_count += 1;
        }
    }
    patterns
}

/// Repeating three-event type sequences, one entry per repeating window.
///
/// Events are ordered by timestamp (stable for ties). A window is reported
/// when its type triple appears at any other position; `occurrences` counts
/// every position, the reported window included, and `first_seen` is the
/// timestamp the window starts at.
pub fn event_sequences(events: &[EventRecord]) -> Vec<EventSequence> {
    if events.len() < 3 {
        return Vec::new();
    }
    let mut sorted: Vec<&EventRecord> = events.iter().collect();
    sorted.sort_by_key(|e| e.timestamp);

    let windows: Vec<[EventType; 3]> = sorted
        .windows(3)
        .map(|w| [w[0].event_type, w[1].event_type, w[2].event_type])
        .collect();

    let mut counts: HashMap<[EventType; 3], usize> = HashMap::new();
    for w in &windows {
        *counts.entry(*w).or_default() += 1;
    }

    windows
        .iter()
        .enumerate()
        .filter_map(|(i, w)| {
            let occurrences = counts[w];
            (occurrences > 1).then(|| EventSequence {
                sequence: *w,
                occurrences,
                first_seen: sorted[i].timestamp,
            })
        })
        .collect()
}

pub fn event_clusters(events: &[EventRecord]) -> BTreeMap<String, EventCluster> {
    let mut clusters: BTreeMap<String, EventCluster> = BTreeMap::new();
    for event in events {
        let key = format!("{}_{}", event.event_type, event.source);
        let cluster = clusters.entry(key).or_insert_with(|| EventCluster {
            count: 0,
            first_seen: event.timestamp,
            last_seen: event.timestamp,
            severity_distribution: BTreeMap::new(),
        });
        cluster.count += 1;
        cluster.first_seen = cluster.first_seen.min(event.timestamp);
        cluster.last_seen = cluster.last_seen.max(event.timestamp);
        *cluster
            .severity_distribution
            .entry(event.severity)
            .or_default() += 1;
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorCategory, LogMessage, Severity};
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    fn point(name: &str, minute: u32, value: f64) -> MetricPoint {
        MetricPoint {
            name: name.into(),
            value,
            timestamp: ts(minute),
            labels: BTreeMap::new(),
        }
    }

    fn event(minute: u32, event_type: EventType, source: &str) -> EventRecord {
        EventRecord {
            timestamp: ts(minute),
            event_type,
            message: LogMessage::RawText(format!("{} event", event_type)),
            severity: Severity::Error,
            source: source.into(),
            raw: None,
        }
    }

    fn log(minute: u32, msg: &str, component: Option<&str>) -> LogEntry {
        let mut labels = BTreeMap::new();
        if let Some(c) = component {
            labels.insert("component".to_string(), c.to_string());
        }
        LogEntry {
            timestamp: ts(minute),
            message: LogMessage::RawText(msg.into()),
            labels,
            raw_timestamp: String::new(),
        }
    }

    #[test]
    fn test_pearson_identical_series() {
        let r = pearson(&[1.0, 2.0, 3.0, 4.0], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pearson_inverse_series() {
        let r = pearson(&[1.0, 2.0, 3.0], &[30.0, 20.0, 10.0]).unwrap();
        assert!((r + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pearson_undefined() {
        assert_eq!(pearson(&[1.0], &[2.0]), None);
        assert_eq!(pearson(&[5.0, 5.0, 5.0], &[1.0, 2.0, 3.0]), None);
        assert_eq!(pearson(&[1.0, 2.0], &[1.0]), None);
    }

    #[test]
    fn test_metric_correlation_reports_identical_series() {
        let engine = CorrelationEngine::default();
        let metrics = vec![
            point("cpu_usage", 0, 10.0),
            point("cpu_usage", 1, 20.0),
            point("cpu_usage", 2, 40.0),
            point("load", 0, 10.0),
            point("load", 1, 20.0),
            point("load", 2, 40.0),
        ];
        let out = engine.metric_correlations(&metrics).unwrap();
        let r = &out["cpu_usage_vs_load"];
        assert!((r.coefficient - 1.0).abs() < 1e-9);
        assert_eq!(r.sample_size, 3);
        assert_eq!(r.time_range.start, Some(ts(0)));
        assert_eq!(r.time_range.end, Some(ts(2)));
    }

    #[test]
    fn test_metric_correlation_needs_two_aligned_points() {
        let engine = CorrelationEngine::default();
        let metrics = vec![
            point("cpu_usage", 0, 10.0),
            point("cpu_usage", 1, 20.0),
            point("load", 1, 20.0),
            point("load", 2, 40.0),
        ];
        assert!(engine.metric_correlations(&metrics).unwrap().is_empty());
    }

    #[test]
    fn test_metric_correlation_drops_weak_pairs() {
        let engine = CorrelationEngine::default();
        let metrics = vec![
            point("a", 0, 1.0),
            point("a", 1, 2.0),
            point("a", 2, 3.0),
            point("a", 3, 4.0),
            point("b", 0, 2.0),
            point("b", 1, 1.0),
            point("b", 2, 2.0),
            point("b", 3, 1.0),
        ];
        assert!(engine.metric_correlations(&metrics).unwrap().is_empty());
    }

    #[test]
    fn test_non_finite_metrics_are_isolated() {
        let engine = CorrelationEngine::default();
        let mut doc = ContextDocument::failed("unused");
        doc.error = None;
        doc.metrics = vec![point("a", 0, f64::NAN), point("b", 0, 1.0)];
        doc.logs = vec![log(0, "error: disk full", None)];
        doc.events = vec![event(0, EventType::Error, "api")];

        let out = engine.analyze(&doc);
        assert!(out.metric_correlations.is_empty());
        assert_eq!(out.log_patterns.error_patterns[&ErrorCategory::Disk], 1);
        assert_eq!(out.event_correlations.event_clusters["error_api"].count, 1);
    }

    #[test]
    fn test_log_patterns() {
        let logs = vec![
            log(0, "ERROR connection reset", Some("db")),
            log(5, "error: request timeout", Some("api")),
            log(10, "warning: slow query", Some("db")),
            log(20, "ok", None),
        ];
        let p = log_patterns(&logs);
        assert_eq!(p.error_patterns[&ErrorCategory::Connection], 1);
        assert_eq!(p.error_patterns[&ErrorCategory::Timeout], 1);
        assert_eq!(p.temporal_patterns[&10], 4);
        assert_eq!(p.component_patterns["db"].count, 2);
        assert_eq!(p.component_patterns["db"].error_count, 1);
        assert_eq!(p.component_patterns["db"].warning_count, 1);
        assert_eq!(p.component_patterns["unknown"].count, 1);
    }

    #[test]
    fn test_event_metric_links_respect_window() {
        let engine = CorrelationEngine::default();
        let events = vec![event(0, EventType::Error, "api")];
        let metrics = vec![point("cpu_usage", 20, 95.0), point("cpu_usage", 45, 99.0)];
        let links = engine.event_metric_links(&events, &metrics).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].time_diff_secs, 1200.0);
        assert_eq!(links[0].metric_value, 95.0);
        assert_eq!(links[0].event_type, EventType::Error);
    }

    #[test]
    fn test_event_sequences_repeat() {
        use EventType::*;
        let types = [Error, Warning, Startup, Error, Warning, Startup];
        let events: Vec<_> = types
            .iter()
            .enumerate()
            .rev()
            .map(|(i, t)| event(i as u32, *t, "svc"))
            .collect();
        let seqs = event_sequences(&events);
        assert_eq!(seqs.len(), 2);
        assert_eq!(seqs[0].sequence, [Error, Warning, Startup]);
        assert_eq!(seqs[0].occurrences, 2);
        assert_eq!(seqs[0].first_seen, ts(0));
        assert_eq!(seqs[1].first_seen, ts(3));
    }

    #[test]
    fn test_event_sequences_without_repeats() {
        use EventType::*;
        let events: Vec<_> = [Error, Warning, Startup, Shutdown]
            .iter()
            .enumerate()
            .map(|(i, t)| event(i as u32, *t, "svc"))
            .collect();
        assert!(event_sequences(&events).is_empty());
        assert!(event_sequences(&events[..2]).is_empty());
    }

    #[test]
    fn test_event_clusters() {
        let events = vec![
            event(5, EventType::Error, "api"),
            event(1, EventType::Error, "api"),
            event(3, EventType::Warning, "db"),
        ];
        let clusters = event_clusters(&events);
        let api = &clusters["error_api"];
        assert_eq!(api.count, 2);
        assert_eq!(api.first_seen, ts(1));
        assert_eq!(api.last_seen, ts(5));
        assert_eq!(api.severity_distribution[&Severity::Error], 2);
        assert_eq!(clusters["warning_db"].count, 1);
    }
}
