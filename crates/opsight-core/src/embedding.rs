//! Embedding trait and vector helpers.
//!
//! The [`Embedder`] trait is the seam between retrieval and whatever
//! model server produces vectors. The app crate ships an Ollama-backed
//! implementation; tests plug in deterministic fakes.

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

/// Dimension of the zero vector used when a query cannot be embedded.
pub const DEFAULT_EMBEDDING_DIMS: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;

    /// Output dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("embedder returned no vectors"))
}

/// Embed a single query, falling back to a zero vector on failure.
///
/// A zero vector never matches anything above the default relevance
/// threshold, so retrieval degrades to an empty result instead of an error.
pub async fn embed_query_or_zero(embedder: &dyn Embedder, text: &str) -> Vec<f32> {
    match embed_query(embedder, text).await {
        Ok(vector) if !vector.is_empty() => vector,
        Ok(_) => {
            warn!(model = embedder.model_name(), "Empty embedding, using zero vector");
            zero_vector(embedder.dims())
        }
        Err(e) => {
            warn!(model = embedder.model_name(), error = %e, "Embedding failed, using zero vector");
            zero_vector(embedder.dims())
        }
    }
}

pub fn zero_vector(dims: usize) -> Vec<f32> {
    vec![0.0; if dims == 0 { DEFAULT_EMBEDDING_DIMS } else { dims }]
}

pub fn is_zero_vector(v: &[f32]) -> bool {
    v.iter().all(|x| *x == 0.0)
}

/// Cosine similarity in `[-1, 1]`; `0.0` when either vector has zero norm
/// or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl Embedder for Failing {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("model server down")
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_embed_failure_falls_back_to_zero() {
        let v = embed_query_or_zero(&Failing, "cpu spike").await;
        assert_eq!(v.len(), 8);
        assert!(is_zero_vector(&v));
    }

    #[test]
    fn test_zero_vector_default_dims() {
        assert_eq!(zero_vector(0).len(), DEFAULT_EMBEDDING_DIMS);
    }
}
