//! TOML configuration.
//!
//! Every field has a default, so an empty file (or a missing section) is a
//! valid configuration pointing at local Loki, Chroma, and Ollama instances.
//!
//! ```toml
//! [log_source]
//! url = "http://localhost:3100"
//! job = "varlogs"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//!
//! [context]
//! cache_ttl_secs = 300
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub log_source: LogSourceConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSourceConfig {
    #[serde(default = "default_loki_url")]
    pub url: String,
    #[serde(default = "default_job")]
    pub job: String,
    /// Total attempts per query, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_step")]
    pub step: String,
}

impl Default for LogSourceConfig {
    fn default() -> Self {
        Self {
            url: default_loki_url(),
            job: default_job(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
            step: default_step(),
        }
    }
}

impl LogSourceConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_loki_url() -> String {
    "http://localhost:3100".to_string()
}
fn default_job() -> String {
    "varlogs".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_step() -> String {
    "1m".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    /// When false, retrieval commands run without a vector store and metrics
    /// are read from the log source instead.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_chroma_url")]
    pub url: String,
    #[serde(default = "default_logs_collection")]
    pub logs_collection: String,
    #[serde(default = "default_metrics_collection")]
    pub metrics_collection: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_chroma_url(),
            logs_collection: default_logs_collection(),
            metrics_collection: default_metrics_collection(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_chroma_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_logs_collection() -> String {
    "logs".to_string()
}
fn default_metrics_collection() -> String {
    "metrics".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_ollama_url(),
            model: default_embedding_model(),
            dims: default_dims(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_dims() -> usize {
    opsight_core::embedding::DEFAULT_EMBEDDING_DIMS
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_model() -> String {
    "llama3".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_max_logs")]
    pub max_logs: usize,
    #[serde(default = "default_max_metrics")]
    pub max_metrics: usize,
    /// Items requested from the metric retriever per context build.
    #[serde(default = "default_metric_k")]
    pub metric_k: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_correlation_window_secs")]
    pub correlation_window_secs: u64,
    #[serde(default)]
    pub include_raw_data: bool,
    #[serde(default = "default_window_secs")]
    pub default_window_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_logs: default_max_logs(),
            max_metrics: default_max_metrics(),
            metric_k: default_metric_k(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_size: default_cache_max_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
            correlation_window_secs: default_correlation_window_secs(),
            include_raw_data: false,
            default_window_secs: default_window_secs(),
        }
    }
}

fn default_max_logs() -> usize {
    1000
}
fn default_max_metrics() -> usize {
    1000
}
fn default_metric_k() -> usize {
    50
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_max_size() -> usize {
    1000
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_correlation_window_secs() -> u64 {
    1800
}
fn default_window_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            min_relevance: default_min_relevance(),
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_min_relevance() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` overrides it.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Read and validate a config file. A missing file is an error; use
/// [`Config::default`] for an all-defaults configuration.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.log_source.max_retries == 0 {
        anyhow::bail!("log_source.max_retries must be >= 1");
    }

    if opsight_core::time_window::parse_duration(&config.log_source.step).is_err() {
        anyhow::bail!(
            "log_source.step must be a duration like 15s or 1m, got '{}'",
            config.log_source.step
        );
    }

    if config.retrieval.k == 0 {
        anyhow::bail!("retrieval.k must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.retrieval.min_relevance) {
        anyhow::bail!("retrieval.min_relevance must be in [0.0, 1.0]");
    }

    if config.context.cache_max_size == 0 {
        anyhow::bail!("context.cache_max_size must be >= 1");
    }

    if config.context.sweep_interval_secs == 0 {
        anyhow::bail!("context.sweep_interval_secs must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or ollama.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims == 0 {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.max_retries == 0 {
            anyhow::bail!("embedding.max_retries must be >= 1");
        }
    }

    Ok(())
}
