//! Core data models for opsight.
//!
//! These types flow through the whole pipeline:
//!
//! ```text
//! Loki streams ──▶ LogEntry ──┬──▶ MetricPoint ──┐
//!                             ├──▶ EventRecord ──┼──▶ ContextDocument
//!                             └──────────────────┘         │
//! Vector index ──▶ RetrievedItem ──▶ RetrievalContext      ▼
//!                                                     Correlations
//! ```
//!
//! Every map that ends up in serialized output is a `BTreeMap` so two
//! documents built from the same inputs serialize identically.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A log line body, normalized at the parsing boundary.
///
/// Bodies that parse as a JSON object are kept structured; anything else
/// (plain text, JSON scalars, arrays) is kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogMessage {
    Structured(Map<String, Value>),
    RawText(String),
}

impl LogMessage {
    /// Parse a raw body, falling back to text when it is not a JSON object.
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => LogMessage::Structured(map),
            _ => LogMessage::RawText(body.to_string()),
        }
    }

    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            LogMessage::RawText(s) => Cow::Borrowed(s.as_str()),
            LogMessage::Structured(map) => {
                Cow::Owned(serde_json::to_string(map).unwrap_or_default())
            }
        }
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            LogMessage::Structured(map) => Some(map),
            LogMessage::RawText(_) => None,
        }
    }

    /// Lowercased text used by every keyword classifier.
    pub fn lowercase(&self) -> String {
        self.as_text().to_lowercase()
    }
}

impl Default for LogMessage {
    fn default() -> Self {
        LogMessage::RawText(String::new())
    }
}

/// A single log record returned by the log store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: LogMessage,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Original nanosecond epoch string as sent by the store.
    pub raw_timestamp: String,
}

impl LogEntry {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Summary of a log store response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogStats {
    pub total_streams: usize,
    pub total_entries: usize,
    /// Distinct label keys seen across all streams, sorted.
    pub unique_labels: Vec<String>,
}

/// A numeric sample of a named metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Per-metric aggregate over a context window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Error,
    Warning,
    Startup,
    Shutdown,
    Change,
    Info,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Error => "error",
            EventType::Warning => "warning",
            EventType::Startup => "startup",
            EventType::Shutdown => "shutdown",
            EventType::Change => "change",
            EventType::Info => "info",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
    Unknown,
}

impl Severity {
    /// Map a free-form level string (`"WARN"`, `"fatal"`, ...) to a severity.
    pub fn from_level(level: &str) -> Self {
        match level.trim().to_lowercase().as_str() {
            "critical" | "crit" | "fatal" | "emergency" | "alert" => Severity::Critical,
            "error" | "err" => Severity::Error,
            "warning" | "warn" => Severity::Warning,
            "info" | "notice" | "debug" | "trace" => Severity::Info,
            _ => Severity::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operational event derived from a log line by keyword classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: LogMessage,
    pub severity: Severity,
    pub source: String,
    /// The originating entry, kept only when raw data is requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<LogEntry>,
}

/// Aggregate counts over a set of events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventStats {
    pub total: usize,
    pub by_type: BTreeMap<EventType, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_source: BTreeMap<String, usize>,
    /// Event counts per `YYYY-MM-DDTHH` bucket.
    pub timeline: BTreeMap<String, usize>,
}

/// Which retriever produced a [`RetrievedItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemSource {
    Log,
    Metric,
}

/// Structured metric content carried by metric-index documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReading {
    pub name: String,
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: String,
}

/// A vector-search hit after relevance scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub id: String,
    pub content: LogMessage,
    pub metadata: Map<String, Value>,
    /// Relevance in `[0.0, 1.0]`, derived from vector distance.
    pub relevance_score: f64,
    pub source: ItemSource,
    pub retrieved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<MetricReading>,
}

impl RetrievedItem {
    /// The item's own timestamp, read from the `timestamp` metadata field.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.metadata.get("timestamp")?.as_str()?;
        crate::time_window::parse_timestamp(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    Logs,
    Metrics,
    Events,
}

impl ContextType {
    pub const ALL: [ContextType; 3] = [ContextType::Logs, ContextType::Metrics, ContextType::Events];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Logs => "logs",
            ContextType::Metrics => "metrics",
            ContextType::Events => "events",
        }
    }
}

impl std::str::FromStr for ContextType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "logs" | "log" => Ok(ContextType::Logs),
            "metrics" | "metric" => Ok(ContextType::Metrics),
            "events" | "event" => Ok(ContextType::Events),
            other => Err(format!(
                "unknown context type '{}': expected logs, metrics, or events",
                other
            )),
        }
    }
}

/// Describes the request a [`ContextDocument`] answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub context_id: uuid::Uuid,
    pub query: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub types: Option<Vec<ContextType>>,
    pub time_range_label: String,
}

/// Pearson correlation between two aligned metric series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub coefficient: f64,
    pub sample_size: usize,
    pub time_range: TimeRange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Timeout,
    Connection,
    Permission,
    Memory,
    Disk,
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentStats {
    pub count: usize,
    pub error_count: usize,
    pub warning_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogPatterns {
    pub error_patterns: BTreeMap<ErrorCategory, usize>,
    /// Log counts per hour of day (0-23, UTC).
    pub temporal_patterns: BTreeMap<u32, usize>,
    pub component_patterns: BTreeMap<String, ComponentStats>,
}

/// An event that happened close in time to a metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetricLink {
    pub event_type: EventType,
    pub metric: String,
    pub time_diff_secs: f64,
    pub metric_value: f64,
}

/// A three-event type sequence that occurs more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSequence {
    pub sequence: [EventType; 3],
    pub occurrences: usize,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCluster {
    pub count: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub severity_distribution: BTreeMap<Severity, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventCorrelations {
    pub event_metric_correlations: Vec<EventMetricLink>,
    pub event_sequences: Vec<EventSequence>,
    pub event_clusters: BTreeMap<String, EventCluster>,
}

/// Everything the correlation engine found in one context document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Correlations {
    pub metric_correlations: BTreeMap<String, CorrelationResult>,
    pub log_patterns: LogPatterns,
    pub event_correlations: EventCorrelations,
}

/// The unified, cacheable assembly of logs, metrics, events, and
/// correlations for one query and time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDocument {
    pub metadata: Option<ContextMetadata>,
    pub logs: Vec<LogEntry>,
    pub log_stats: LogStats,
    pub metrics: Vec<MetricPoint>,
    pub metric_stats: BTreeMap<String, MetricSummary>,
    pub events: Vec<EventRecord>,
    pub event_stats: EventStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlations: Option<Correlations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl ContextDocument {
    /// A document with no data for the given request.
    pub fn new(metadata: ContextMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            logs: Vec::new(),
            log_stats: LogStats::default(),
            metrics: Vec::new(),
            metric_stats: BTreeMap::new(),
            events: Vec::new(),
            event_stats: EventStats::default(),
            correlations: None,
            error: None,
            generated_at: Utc::now(),
        }
    }

    /// The canonical empty shape returned when context assembly fails.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            metadata: None,
            logs: Vec::new(),
            log_stats: LogStats::default(),
            metrics: Vec::new(),
            metric_stats: BTreeMap::new(),
            events: Vec::new(),
            event_stats: EventStats::default(),
            correlations: None,
            error: Some(reason.into()),
            generated_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.metrics.is_empty() && self.events.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSummary {
    pub total_items: usize,
    pub log_count: usize,
    pub metric_count: usize,
    pub avg_relevance: f64,
    pub timestamp_range: TimeRange,
}

/// Vector-retrieved evidence for prompt construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalContext {
    pub logs: Vec<RetrievedItem>,
    pub metrics: Vec<RetrievedItem>,
    pub summary: RetrievalSummary,
}
