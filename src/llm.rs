//! Text completion over Ollama's `/api/generate`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::config::LlmConfig;

#[async_trait]
pub trait Completion: Send + Sync {
    fn model_name(&self) -> &str;

    /// Complete `prompt`, failing if no answer arrives within `timeout`.
    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String>;
}

pub struct OllamaCompletion {
    url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaCompletion {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            client: reqwest::Client::builder().build()?,
        })
    }
}

#[async_trait]
impl Completion for OllamaCompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, prompt), fields(model = %self.model, prompt_len = prompt.len()))]
    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let url = format!("{}/api/generate", self.url);
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let work = async {
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("Failed to reach Ollama at {}", self.url))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                bail!("Ollama API error {}: {}", status, text);
            }
            let parsed: GenerateResponse = response.json().await?;
            Ok::<_, anyhow::Error>(parsed.response)
        };

        let answer = tokio::time::timeout(timeout, work)
            .await
            .with_context(|| format!("Completion timed out after {}s", timeout.as_secs()))??;
        debug!(chars = answer.len(), "Completion received");
        Ok(answer)
    }
}
