use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::{ErrorCode, RetrievalError};

/// Abstract contract for turning text into a fixed-dimension vector. Used
/// by the Ingestion Orchestrator (batch) and the `dense`/`hyde`/`multi_query`
/// retrievers (single query, or one call per hypothetical/variant).
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed_batch(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed_one(&self, text: &str, model: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut out = self.embed_batch(std::slice::from_ref(&text.to_string()), model).await?;
        Ok(out.pop().unwrap_or_default())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding call timed out")]
    Timeout,
    #[error("embedding upstream unavailable after retries: {0}")]
    UpstreamUnavailable(String),
}

impl RetrievalError for EmbeddingError {
    fn error_code(&self) -> ErrorCode {
        match self {
            EmbeddingError::Timeout => ErrorCode::Timeout,
            EmbeddingError::UpstreamUnavailable(_) => ErrorCode::UpstreamUnavailable,
        }
    }
}

/// Deterministic hash-to-float embedding, used by test fixtures and any
/// deployment without a real embedding provider configured. Same inputs
/// always produce the same vector.
pub fn deterministic_embedding(text: &str, model_id: &str, dims: usize) -> Vec<f32> {
    let dims = dims.max(1);

    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    let mut out = Vec::with_capacity(dims);
    for i in 0..dims {
        let byte = digest[i % digest.len()];
        let value = (byte as f32 / 127.5) - 1.0;
        out.push(value);
    }

    out
}

/// An [`EmbeddingClient`] backed by [`deterministic_embedding`], with a
/// configurable dimensionality. Useful for tests and for deployments that
/// have not wired a real provider.
pub struct DeterministicEmbeddingClient {
    pub dimensions: usize,
}

#[async_trait]
impl EmbeddingClient for DeterministicEmbeddingClient {
    async fn embed_batch(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|t| deterministic_embedding(t, model, self.dimensions))
            .collect())
    }
}
