//! Error taxonomy shared by every opsight component.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Why a time window was rejected by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRange {
    #[error("start time {start} is after end time {end}")]
    StartAfterEnd {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("end time {0} is in the future")]
    EndInFuture(DateTime<Utc>),

    #[error("time window of {days} days exceeds the maximum of {max_days} days")]
    TooWide { days: i64, max_days: i64 },
}

/// Errors surfaced by context assembly, retrieval, and correlation.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The time window failed validation.
    #[error("invalid time range: {0}")]
    InvalidRange(#[from] InvalidRange),

    /// Retries were exhausted against an external data source.
    #[error("{source_name} unavailable: {reason}")]
    SourceUnavailable {
        source_name: String,
        reason: String,
        status: Option<u16>,
    },

    /// The embedding call failed or returned an unusable vector.
    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    /// A specific correlation sub-analysis failed.
    #[error("correlation analysis '{analysis}' failed: {reason}")]
    CorrelationFailure { analysis: String, reason: String },
}

impl ContextError {
    pub fn correlation(analysis: &str, reason: impl Into<String>) -> Self {
        Self::CorrelationFailure {
            analysis: analysis.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = ContextError> = std::result::Result<T, E>;
