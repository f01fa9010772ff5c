//! LLM client contract shared by the `hyde`/`multi_query` retrievers and the
//! RAG Orchestrator. No teacher analogue exists for this component (the
//! teacher only ever called an embedding model); grounded on the same
//! trait-at-the-seam shape as `kb_core::embedding::EmbeddingClient` and the
//! same deterministic-fixture convention, since no real LLM provider
//! credentials are available in this environment.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use kb_core::error::{ErrorCode, RetrievalError};

#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
}

/// Generation inputs, bounded by configured maxima per §4.7 step 3.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: usize,
    pub top_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 512,
            top_p: 1.0,
        }
    }
}

impl GenerationParams {
    /// Clamps caller-supplied generation params to configured maxima.
    pub fn bounded(self, max_tokens_ceiling: usize) -> Self {
        Self {
            temperature: self.temperature.clamp(0.0, 2.0),
            max_tokens: self.max_tokens.min(max_tokens_ceiling),
            top_p: self.top_p.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LlmError {
    #[error("llm call timed out")]
    Timeout,
    #[error("llm upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl RetrievalError for LlmError {
    fn error_code(&self) -> ErrorCode {
        match self {
            LlmError::Timeout => ErrorCode::Timeout,
            LlmError::UpstreamUnavailable(_) => ErrorCode::UpstreamUnavailable,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        config: &LlmConfig,
        params: &GenerationParams,
    ) -> Result<String, LlmError>;
}

/// Deterministic LLM stand-in: same prompt + model always produces the same
/// text. Used as the default provider, mirroring
/// `DeterministicEmbeddingClient`'s role for the Embedding Client contract.
pub struct DeterministicLlmClient;

#[async_trait]
impl LlmClient for DeterministicLlmClient {
    async fn complete(
        &self,
        prompt: &str,
        config: &LlmConfig,
        params: &GenerationParams,
    ) -> Result<String, LlmError> {
        let mut hasher = Sha256::new();
        hasher.update(config.model.as_bytes());
        hasher.update(prompt.as_bytes());
        let digest = hasher.finalize();
        let token = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);

        let excerpt: String = prompt.chars().take(80).collect();
        let text = format!("[{}:{:08x}] {}", config.model, token, excerpt);
        Ok(text.chars().take(params.max_tokens.max(1)).collect())
    }
}

/// Resolves an [`LlmClient`] for a configured provider. Only `deterministic`
/// is wired up; a real provider would be an additional match arm, mirroring
/// `kb_ingestion::embedding::build_embedding_client`.
pub fn build_llm_client(config: &LlmConfig) -> std::sync::Arc<dyn LlmClient> {
    let _ = &config.provider;
    std::sync::Arc::new(DeterministicLlmClient)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deterministic_completion_is_reproducible() {
        let client = DeterministicLlmClient;
        let config = LlmConfig {
            provider: "deterministic".to_string(),
            model: "llm-default-v1".to_string(),
        };
        let params = GenerationParams::default();
        let a = client.complete("hello", &config, &params).await.unwrap();
        let b = client.complete("hello", &config, &params).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn deterministic_completion_varies_with_prompt() {
        let client = DeterministicLlmClient;
        let config = LlmConfig {
            provider: "deterministic".to_string(),
            model: "llm-default-v1".to_string(),
        };
        let params = GenerationParams::default();
        let a = client.complete("hello", &config, &params).await.unwrap();
        let b = client.complete("goodbye", &config, &params).await.unwrap();
        assert_ne!(a, b);
    }
}
