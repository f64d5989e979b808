//! Log store client.
//!
//! [`LogSource`] is the seam the context manager fetches logs, metric
//! lines, and event lines through. [`LokiClient`] implements it over
//! Loki's `query_range` HTTP API.
//!
//! # Query shape
//!
//! | Filter | LogQL |
//! |--------|-------|
//! | none | `{job="varlogs"}` |
//! | [`LogFilter::MetricName`] | `{job="varlogs",metric_name="cpu_usage"}` |
//! | [`LogFilter::LineMatch`] | `{job="varlogs"} \|~ "(?i)(error\|warning)"` |
//!
//! # Retry strategy
//!
//! `max_retries` is the total number of attempts:
//! - HTTP 429 → wait `Retry-After` seconds, fractions allowed (or `retry_delay`), retry
//! - HTTP 5xx, connect errors, timeouts → wait `retry_delay * 2^attempt`, retry
//! - Any other status or an undecodable body → fail immediately
//! - No wait after the final attempt

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsight_core::error::{ContextError, InvalidRange};
use opsight_core::models::{LogEntry, LogMessage, LogStats};
use opsight_core::time_window::{self, TimeWindowResolver};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::LogSourceConfig;

const SOURCE_NAME: &str = "loki";

#[derive(Debug, Error)]
pub enum LogSourceError {
    #[error("invalid time range: {0}")]
    InvalidRange(#[from] InvalidRange),

    #[error("log source unavailable after {attempts} attempts: {last_error}")]
    Unavailable {
        attempts: u32,
        status: Option<u16>,
        last_error: String,
    },

    #[error("log source rejected query with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to decode log source response: {0}")]
    Decode(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl From<LogSourceError> for ContextError {
    fn from(err: LogSourceError) -> Self {
        match err {
            LogSourceError::InvalidRange(r) => ContextError::InvalidRange(r),
            other => {
                let status = match &other {
                    LogSourceError::Unavailable { status, .. } => *status,
                    LogSourceError::Rejected { status, .. } => Some(*status),
                    _ => None,
                };
                ContextError::SourceUnavailable {
                    source_name: SOURCE_NAME.to_string(),
                    reason: other.to_string(),
                    status,
                }
            }
        }
    }
}

/// Narrows a log query.
#[derive(Debug, Clone, PartialEq)]
pub enum LogFilter {
    /// Only streams labelled `metric_name="<name>"`.
    MetricName(String),
    /// Only lines matching every pattern, case-insensitively.
    LineMatch(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogQueryResult {
    pub entries: Vec<LogEntry>,
    pub stats: LogStats,
    /// The LogQL expression that was sent.
    pub query: String,
    pub time_range_label: String,
}

#[async_trait]
pub trait LogSource: Send + Sync {
    async fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: Option<&LogFilter>,
        limit: usize,
    ) -> Result<LogQueryResult, LogSourceError>;
}

#[derive(Debug, Clone)]
pub struct LokiClient {
    base_url: String,
    job: String,
    step: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
    resolver: TimeWindowResolver,
}

impl LokiClient {
    pub fn new(config: &LogSourceConfig) -> Result<Self, LogSourceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| LogSourceError::Client(e.to_string()))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            job: config.job.clone(),
            step: config.step.clone(),
            client,
            max_retries: config.max_retries.max(1),
            retry_delay: config.retry_delay(),
            resolver: TimeWindowResolver::default(),
        })
    }

    /// Build the LogQL expression for a filter.
    pub fn build_query(&self, filter: Option<&LogFilter>) -> String {
        let job = quote(&self.job);
        match filter {
            None => format!("{{job={}}}", job),
            Some(LogFilter::MetricName(name)) => {
                format!("{{job={},metric_name={}}}", job, quote(name))
            }
            Some(LogFilter::LineMatch(patterns)) => {
                let mut q = format!("{{job={}}}", job);
                for p in patterns {
                    q.push_str(&format!(" |~ {}", quote(&format!("(?i)({})", p))));
                }
                q
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay * 2u32.pow(attempt.min(10))
    }

    async fn fetch(&self, params: &[(&str, String)]) -> Result<Value, LogSourceError> {
        let url = format!("{}/loki/api/v1/query_range", self.base_url);
        let mut last_status = None;
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            let is_last = attempt + 1 == self.max_retries;

            let wait = match self.client.get(&url).query(params).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response
                            .text()
                            .await
                            .map_err(|e| LogSourceError::Decode(e.to_string()))?;
                        return serde_json::from_str(&body)
                            .map_err(|e| LogSourceError::Decode(e.to_string()));
                    }

                    last_status = Some(status.as_u16());
                    if status.as_u16() == 429 {
                        last_error = "rate limited".to_string();
                        retry_after(response.headers()).unwrap_or(self.retry_delay)
                    } else if status.is_server_error() {
                        last_error = response.text().await.unwrap_or_default();
                        if last_error.is_empty() {
                            last_error = status.to_string();
                        }
                        self.backoff(attempt)
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(LogSourceError::Rejected {
                            status: status.as_u16(),
                            body,
                        });
                    }
                }
                Err(e) => {
                    last_status = None;
                    last_error = e.to_string();
                    self.backoff(attempt)
                }
            };

            warn!(
                attempt = attempt + 1,
                max_attempts = self.max_retries,
                status = ?last_status,
                error = %last_error,
                "Log source request failed"
            );
            if !is_last {
                tokio::time::sleep(wait).await;
            }
        }

        Err(LogSourceError::Unavailable {
            attempts: self.max_retries,
            status: last_status,
            last_error,
        })
    }
}

#[async_trait]
impl LogSource for LokiClient {
    #[instrument(skip(self, filter), fields(job = %self.job))]
    async fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: Option<&LogFilter>,
        limit: usize,
    ) -> Result<LogQueryResult, LogSourceError> {
        let window = self.resolver.check(start, end)?;
        let (start_ns, end_ns) = window.to_nanos();
        let query = self.build_query(filter);

        let params = [
            ("query", query.clone()),
            ("start", start_ns),
            ("end", end_ns),
            ("limit", limit.to_string()),
            ("step", self.step.clone()),
        ];
        let body = self.fetch(&params).await?;
        let (entries, stats) = parse_streams(&body)?;

        debug!(
            query = %query,
            streams = stats.total_streams,
            entries = stats.total_entries,
            "Log query complete"
        );
        Ok(LogQueryResult {
            entries,
            stats,
            query,
            time_range_label: window.human_label(),
        })
    }
}

/// `Retry-After` as (possibly fractional) seconds. HTTP-date values and
/// anything negative or unrepresentable yield `None`.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let secs: f64 = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// LogQL string literal.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Flatten a `query_range` streams response into entries.
pub fn parse_streams(body: &Value) -> Result<(Vec<LogEntry>, LogStats), LogSourceError> {
    let streams = body
        .pointer("/data/result")
        .and_then(Value::as_array)
        .ok_or_else(|| LogSourceError::Decode("missing data.result array".to_string()))?;

    let mut entries = Vec::new();
    let mut label_keys = BTreeSet::new();

    for stream in streams {
        let labels: std::collections::BTreeMap<String, String> = stream
            .get("stream")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        label_keys.extend(labels.keys().cloned());

        let values = stream
            .get("values")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for pair in values {
            let parsed = pair.as_array().and_then(|p| {
                let raw_ts = p.first()?.as_str()?;
                let line = p.get(1)?.as_str()?;
                let ts = time_window::from_epoch_nanos(raw_ts)?;
                Some((raw_ts, ts, line))
            });
            let Some((raw_ts, timestamp, line)) = parsed else {
                warn!(value = %pair, "Skipping malformed log entry");
                continue;
            };
            entries.push(LogEntry {
                timestamp,
                message: LogMessage::from_body(line),
                labels: labels.clone(),
                raw_timestamp: raw_ts.to_string(),
            });
        }
    }

    let stats = LogStats {
        total_streams: streams.len(),
        total_entries: entries.len(),
        unique_labels: label_keys.into_iter().collect(),
    };
    Ok((entries, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> LokiClient {
        LokiClient::new(&LogSourceConfig {
            job: "api".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_build_query() {
        let c = client();
        assert_eq!(c.build_query(None), r#"{job="api"}"#);
        assert_eq!(
            c.build_query(Some(&LogFilter::MetricName("cpu_usage".into()))),
            r#"{job="api",metric_name="cpu_usage"}"#
        );
        assert_eq!(
            c.build_query(Some(&LogFilter::LineMatch(vec![
                "error|warning".into(),
                r"spike|\(prod\)".into(),
            ]))),
            r#"{job="api"} |~ "(?i)(error|warning)" |~ "(?i)(spike|\\(prod\\))""#
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let c = client();
        assert_eq!(c.backoff(0), Duration::from_secs(1));
        assert_eq!(c.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_after_accepts_fractional_seconds() {
        use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

        let header = |v: &'static str| {
            let mut h = HeaderMap::new();
            h.insert(RETRY_AFTER, HeaderValue::from_static(v));
            h
        };
        assert_eq!(retry_after(&header("1.5")), Some(Duration::from_millis(1500)));
        assert_eq!(retry_after(&header(" 2 ")), Some(Duration::from_secs(2)));
        assert_eq!(retry_after(&header("-1")), None);
        assert_eq!(retry_after(&header("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(retry_after(&header("1e400")), None);
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn test_parse_streams() {
        let body = json!({
            "status": "success",
            "data": {
                "resultType": "streams",
                "result": [
                    {
                        "stream": {"job": "api", "level": "error"},
                        "values": [
                            ["1709287200000000000", "{\"msg\":\"boom\"}"],
                            ["1709287260000000000", "plain line"],
                            ["garbage"],
                        ]
                    },
                    {
                        "stream": {"job": "api", "source": "worker"},
                        "values": [["1709287320000000000", "42"]]
                    }
                ]
            }
        });
        let (entries, stats) = parse_streams(&body).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].message.as_object().is_some());
        assert_eq!(entries[1].message, LogMessage::RawText("plain line".into()));
        assert_eq!(entries[2].message, LogMessage::RawText("42".into()));
        assert_eq!(entries[0].label("level"), Some("error"));
        assert_eq!(stats.total_streams, 2);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.unique_labels, vec!["job", "level", "source"]);
    }

    #[test]
    fn test_parse_streams_rejects_unexpected_shape() {
        assert!(matches!(
            parse_streams(&json!({"status": "error"})),
            Err(LogSourceError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_range_fails_before_request() {
        let c = client();
        let now = Utc::now();
        let err = c
            .query(now, now - chrono::Duration::hours(1), None, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, LogSourceError::InvalidRange(_)));
        assert!(matches!(
            ContextError::from(err),
            ContextError::InvalidRange(InvalidRange::StartAfterEnd { .. })
        ));
    }

    #[test]
    fn test_unavailable_maps_to_source_unavailable() {
        let err = LogSourceError::Unavailable {
            attempts: 3,
            status: Some(503),
            last_error: "down".into(),
        };
        match ContextError::from(err) {
            ContextError::SourceUnavailable {
                source_name,
                status,
                ..
            } => {
                assert_eq!(source_name, "loki");
                assert_eq!(status, Some(503));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
