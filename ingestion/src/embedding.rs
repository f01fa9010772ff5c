//! Re-exports the Embedding Client contract from `kb-core` so the rest of
//! this crate can depend on `crate::embedding` without reaching across
//! crate boundaries, and adds a factory keyed by the KB's configured
//! provider.

pub use kb_core::embedding::{DeterministicEmbeddingClient, EmbeddingClient, EmbeddingError};

use kb_core::model::EmbeddingConfig;
use std::sync::Arc;

/// Resolves an [`EmbeddingClient`] for a KB's embedding config. Only the
/// `deterministic` provider is wired up here; real providers (OpenAI,
/// Cohere, ...) would be added as additional match arms without changing
/// callers, mirroring the Chunker/Retriever registries' construction
/// discipline.
pub fn build_embedding_client(config: &EmbeddingConfig) -> Arc<dyn EmbeddingClient> {
    // "deterministic" is the only provider wired up so far; a real provider
    // (OpenAI, Cohere, ...) would be an additional match arm here.
    let _ = &config.provider;
    Arc::new(DeterministicEmbeddingClient {
        dimensions: config.dimensions,
    })
}
