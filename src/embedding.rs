//! Embedding providers.
//!
//! Implementations of [`opsight_core::embedding::Embedder`]:
//! - **[`DisabledEmbedder`]**: always errors; retrieval then falls back to
//!   zero vectors and returns nothing.
//! - **[`OllamaEmbedder`]**: calls Ollama's `/api/embed` with retry and
//!   backoff.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, ... (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use opsight_core::embedding::Embedder;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;

/// Used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder {
    dims: usize,
}

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("embedding provider is disabled")
    }
}

pub struct OllamaEmbedder {
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dims: config.dims,
            max_retries: config.max_retries.max(1),
            client,
        })
    }

    /// `embed` with an explicit backoff base.
    async fn embed_with_backoff(&self, texts: &[String], base: Duration) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/api/embed", self.url);
        let mut last_err = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = base * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.client.post(&url).json(&body).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let vectors = parse_ollama_response(&json)?;
                        debug!(model = %self.model, count = vectors.len(), "Embedded texts");
                        return Ok(vectors);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(attempt = attempt + 1, %status, "Embedding request failed, retrying");
                        last_err = Some(anyhow::anyhow!("Ollama API error {}: {}", status, body_text));
                        continue;
                    }

                    bail!("Ollama API error {}: {}", status, body_text);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Embedding request failed, retrying");
                    last_err = Some(e.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_with_backoff(texts, Duration::from_secs(1)).await
    }
}

/// Extract `embeddings[][]` from an `/api/embed` response.
fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("embeddings")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    data.iter()
        .map(|item| {
            let values = item
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?;
            Ok(values
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect())
        })
        .collect()
}

/// Create the configured embedder.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder { dims: config.dims })),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ollama_response() {
        let json = json!({"model": "nomic", "embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let vectors = parse_ollama_response(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], vec![0.3f32, 0.4]);
    }

    #[test]
    fn test_parse_ollama_response_missing_field() {
        assert!(parse_ollama_response(&json!({"error": "model not found"})).is_err());
    }

    #[tokio::test]
    async fn test_disabled_embedder_errors() {
        let embedder = create_embedder(&EmbeddingConfig {
            provider: "disabled".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(embedder.model_name(), "disabled");
        assert!(embedder.embed(&["x".to_string()]).await.is_err());
    }

    #[test]
    fn test_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "openai".into(),
            ..Default::default()
        };
        assert!(create_embedder(&config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_exhausts_retries() {
        let embedder = OllamaEmbedder::new(&EmbeddingConfig {
            url: "http://127.0.0.1:1".into(),
            max_retries: 2,
            timeout_secs: 1,
            ..Default::default()
        })
        .unwrap();
        let result = embedder
            .embed_with_backoff(&["cpu".to_string()], Duration::from_millis(1))
            .await;
        assert!(result.is_err());
    }
}
