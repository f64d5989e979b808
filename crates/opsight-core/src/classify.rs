//! Keyword classification of log lines into events, metrics, and error
//! categories.
//!
//! All matching is case-insensitive substring matching over the rendered
//! message text. The first matching rule wins, so the order of each table
//! below is significant.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::models::{
    ErrorCategory, EventRecord, EventStats, EventType, LogEntry, MetricPoint, MetricSummary,
    RetrievedItem, Severity,
};

/// Words that make a log line an event.
pub const EVENT_KEYWORDS: [&str; 6] = ["error", "warning", "critical", "failed", "started", "stopped"];

const METRIC_KEYWORDS: [(&[&str], &str); 4] = [
    (&["cpu"], "cpu_usage"),
    (&["memory", "ram"], "memory_usage"),
    (&["disk", "storage"], "disk_usage"),
    (&["network"], "network_usage"),
];

const EVENT_TYPE_KEYWORDS: [(&str, EventType); 5] = [
    ("error", EventType::Error),
    ("warning", EventType::Warning),
    ("started", EventType::Startup),
    ("stopped", EventType::Shutdown),
    ("modified", EventType::Change),
];

const SEVERITY_KEYWORDS: [(&[&str], Severity); 4] = [
    (&["critical", "fatal"], Severity::Critical),
    (&["error"], Severity::Error),
    (&["warning"], Severity::Warning),
    (&["info"], Severity::Info),
];

const ERROR_CATEGORY_KEYWORDS: [(&str, ErrorCategory); 5] = [
    ("timeout", ErrorCategory::Timeout),
    ("connection", ErrorCategory::Connection),
    ("permission", ErrorCategory::Permission),
    ("memory", ErrorCategory::Memory),
    ("disk", ErrorCategory::Disk),
];

/// Guess which metric a free-text query is about.
///
/// ```rust
/// use opsight_core::classify::detect_metric_type;
///
/// assert_eq!(detect_metric_type("CPU spike last hour"), Some("cpu_usage"));
/// assert_eq!(detect_metric_type("why is the RAM full"), Some("memory_usage"));
/// assert_eq!(detect_metric_type("login failures"), None);
/// ```
pub fn detect_metric_type(query: &str) -> Option<&'static str> {
    let lower = query.to_lowercase();
    METRIC_KEYWORDS
        .iter()
        .find(|(words, _)| words.iter().any(|w| lower.contains(w)))
        .map(|(_, metric)| *metric)
}

pub fn is_event_line(entry: &LogEntry) -> bool {
    let text = entry.message.lowercase();
    EVENT_KEYWORDS.iter().any(|k| text.contains(k))
}

pub fn event_type_of(text_lower: &str) -> EventType {
    EVENT_TYPE_KEYWORDS
        .iter()
        .find(|(k, _)| text_lower.contains(k))
        .map(|(_, t)| *t)
        .unwrap_or(EventType::Info)
}

/// Severity from the `level` label when present, else from keywords.
pub fn severity_of(entry: &LogEntry, text_lower: &str) -> Severity {
    if let Some(level) = entry.label("level") {
        return Severity::from_level(level);
    }
    SEVERITY_KEYWORDS
        .iter()
        .find(|(words, _)| words.iter().any(|w| text_lower.contains(w)))
        .map(|(_, s)| *s)
        .unwrap_or(Severity::Unknown)
}

pub fn categorize_error(text_lower: &str) -> ErrorCategory {
    ERROR_CATEGORY_KEYWORDS
        .iter()
        .find(|(k, _)| text_lower.contains(k))
        .map(|(_, c)| *c)
        .unwrap_or(ErrorCategory::Other)
}

pub fn to_event(entry: &LogEntry, include_raw: bool) -> EventRecord {
    let text = entry.message.lowercase();
    EventRecord {
        timestamp: entry.timestamp,
        event_type: event_type_of(&text),
        message: entry.message.clone(),
        severity: severity_of(entry, &text),
        source: entry.label("source").unwrap_or("unknown").to_string(),
        raw: include_raw.then(|| entry.clone()),
    }
}

/// Classify the event-bearing subset of `entries`.
pub fn to_events(entries: &[LogEntry], include_raw: bool) -> Vec<EventRecord> {
    entries
        .iter()
        .filter(|e| is_event_line(e))
        .map(|e| to_event(e, include_raw))
        .collect()
}

pub fn event_stats(events: &[EventRecord]) -> EventStats {
    let mut stats = EventStats {
        total: events.len(),
        ..Default::default()
    };
    for event in events {
        *stats.by_type.entry(event.event_type).or_default() += 1;
        *stats.by_severity.entry(event.severity).or_default() += 1;
        *stats.by_source.entry(event.source.clone()).or_default() += 1;
        let hour = event.timestamp.format("%Y-%m-%dT%H").to_string();
        *stats.timeline.entry(hour).or_default() += 1;
    }
    stats
}

/// Line filters sent to the log store when fetching events: the event
/// keywords, then any query term longer than three characters.
pub fn event_line_filters(query: &str) -> Vec<String> {
    let mut filters = vec![EVENT_KEYWORDS.join("|")];
    let terms: Vec<String> = query
        .split_whitespace()
        .map(str::trim)
        .filter(|t| t.chars().count() > 3)
        .map(escape_regex)
        .collect();
    if !terms.is_empty() {
        filters.push(terms.join("|"));
    }
    filters
}

fn escape_regex(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if "\\.+*?()|[]{}^$\"".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Extract metric samples from structured log lines carrying a numeric
/// `value`.
pub fn metrics_from_logs(entries: &[LogEntry]) -> Vec<MetricPoint> {
    entries
        .iter()
        .filter_map(|entry| {
            let payload = entry.message.as_object()?;
            let value = payload.get("value")?.as_f64()?;
            let name = entry
                .label("metric_name")
                .or_else(|| payload.get("name").and_then(|n| n.as_str()))
                .unwrap_or("unknown");
            Some(MetricPoint {
                name: name.to_string(),
                value,
                timestamp: entry.timestamp,
                labels: entry.labels.clone(),
            })
        })
        .collect()
}

/// Convert metric-index hits into samples. Hits without a numeric value are
/// dropped; hits without a `timestamp` field are stamped with their
/// retrieval time.
pub fn metrics_from_items(items: &[RetrievedItem]) -> Vec<MetricPoint> {
    items
        .iter()
        .filter_map(|item| {
            let reading = item.metric.as_ref()?;
            let value = reading.value?;
            let timestamp: DateTime<Utc> = item.timestamp().unwrap_or(item.retrieved_at);
            let labels = item
                .metadata
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
            Some(MetricPoint {
                name: reading.name.clone(),
                value,
                timestamp,
                labels,
            })
        })
        .collect()
}

pub fn metric_stats(points: &[MetricPoint]) -> BTreeMap<String, MetricSummary> {
    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for p in points {
        groups.entry(p.name.clone()).or_default().push(p.value);
    }
    groups
        .into_iter()
        .map(|(name, values)| {
            let count = values.len();
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = values.iter().sum::<f64>() / count as f64;
            (name, MetricSummary { count, min, max, avg })
        })
        .collect()
}
