//! RAG Orchestrator (§4.7): calls the Query Orchestrator, assembles a
//! grounded prompt from the hits it returns, and invokes the LLM client.
//! No teacher analogue (the teacher never called a generative model); the
//! LLM provider+model is a call-level input here rather than sourced from
//! the KB, since `KnowledgeBaseConfig` has no `llm` field (see DESIGN.md).

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use kb_core::error::{ErrorCode, RetrievalError};
use kb_core::identity::RequestContext;

use crate::llm::{GenerationParams, LlmClient, LlmConfig, LlmError};
use crate::orchestrator::{ModelInfo, QueryError, QueryOrchestrator};
use crate::retriever::Hit;

const SYSTEM_PREAMBLE: &str = "You are a retrieval-augmented assistant. Answer only from the \
provided context. If the context does not contain the answer, say so plainly.";

/// Approximates an LLM's context window in characters; this stack has no
/// tokenizer dependency, so truncation is char-budgeted rather than
/// token-budgeted.
const CONTEXT_BUDGET_CHARS: usize = 8_000;

const MAX_TOKENS_CEILING: usize = 2_048;

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Hit>,
    pub model_info: ModelInfo,
    pub retrieval_count: usize,
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("query error: {0}")]
    Query(#[from] QueryError),
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
}

impl RetrievalError for RagError {
    fn error_code(&self) -> ErrorCode {
        match self {
            RagError::Query(err) => err.error_code(),
            RagError::Llm(err) => err.error_code(),
        }
    }
}

pub struct RagOrchestrator {
    query_orchestrator: Arc<QueryOrchestrator>,
    llm_client: Arc<dyn LlmClient>,
}

impl RagOrchestrator {
    pub fn new(query_orchestrator: Arc<QueryOrchestrator>, llm_client: Arc<dyn LlmClient>) -> Self {
        Self {
            query_orchestrator,
            llm_client,
        }
    }

    pub async fn answer(
        &self,
        request_ctx: &RequestContext,
        query: &str,
        kb_ids: &[String],
        top_k: usize,
        retriever_override: Option<&str>,
        llm_config: &LlmConfig,
        generation_params: GenerationParams,
    ) -> Result<Answer, RagError> {
        let query_result = self
            .query_orchestrator
            .retrieve(request_ctx, query, kb_ids, top_k, retriever_override)
            .await?;

        let prompt = assemble_prompt(query, &query_result.hits);
        let bounded_params = generation_params.bounded(MAX_TOKENS_CEILING);
        let text = self
            .llm_client
            .complete(&prompt, llm_config, &bounded_params)
            .await?;

        let mut model_info = query_result.model_info;
        model_info.llm_provider = Some(llm_config.provider.clone());
        model_info.llm_model = Some(llm_config.model.clone());

        Ok(Answer {
            answer: text,
            retrieval_count: query_result.hits.len(),
            sources: query_result.hits,
            model_info,
        })
    }
}

/// Concatenates hit texts with source tags, preserving retrieval order,
/// stopping once the context budget would be exceeded.
fn assemble_prompt(query: &str, hits: &[Hit]) -> String {
    let mut context = String::new();
    for hit in hits {
        let tagged = format!("[{}:{}] {}\n\n", hit.source, hit.chunk_id, hit.text);
        if context.len() + tagged.len() > CONTEXT_BUDGET_CHARS {
            break;
        }
        context.push_str(&tagged);
    }
    format!("{SYSTEM_PREAMBLE}\n\nContext:\n{context}\nQuestion: {query}\nAnswer:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::audit::{AuditSink, InMemoryAuditSink};
    use kb_core::embedding::DeterministicEmbeddingClient;
    use kb_core::identity::RequestIdentity;
    use kb_core::ingest::IngestionRequest;
    use kb_core::acl::AclMeta;
    use kb_core::model::{
        ApiKeyRole, ChunkerConfig, Clearance, EmbeddingConfig, KnowledgeBase, KnowledgeBaseConfig,
        RetrieverConfig, SensitivityLevel, Tenant, TenantQuotas, TenantStatus,
    };
    use kb_ingestion::processor::IngestionPipeline;
    use kb_storage::dense::DenseStore;
    use kb_storage::repo::Repository;
    use kb_storage::sparse::SparseStore;
    use std::collections::HashMap;
    use tempfile::tempdir;

    async fn build_rag_orchestrator() -> (RagOrchestrator, RequestContext, String) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(Repository::open(dir.path().join("rag.wal")).await.unwrap());
        repo.put_tenant(Tenant {
            id: "acme".into(),
            status: TenantStatus::Active,
            quotas: TenantQuotas::unlimited(),
        })
        .await
        .unwrap();

        let knowledge_base = KnowledgeBase {
            id: "kb1".to_string(),
            tenant_id: "acme".to_string(),
            name: "kb1".to_string(),
            config: KnowledgeBaseConfig {
                chunker: ChunkerConfig {
                    name: "simple".to_string(),
                    params: serde_json::json!({"max_chars": 200}),
                },
                retriever: RetrieverConfig {
                    name: "dense".to_string(),
                    params: serde_json::Value::Null,
                },
                embedding: EmbeddingConfig {
                    provider: "deterministic".to_string(),
                    model: "embedding-default-v1".to_string(),
                    dimensions: 16,
                },
            },
        };
        repo.put_knowledge_base(knowledge_base.clone()).await.unwrap();

        let dense = Arc::new(DenseStore::new());
        let sparse = Arc::new(SparseStore::open(dir.path()).unwrap());
        let pipeline = IngestionPipeline::new(repo.clone(), dense.clone(), sparse.clone());
        pipeline
            .ingest(
                "acme",
                &knowledge_base,
                IngestionRequest::Text {
                    content: "The refund policy allows returns within 30 days of purchase.".to_string(),
                    metadata: HashMap::new(),
                    idempotency_key: None,
                },
            )
            .await
            .unwrap();

        let embedding_client = Arc::new(DeterministicEmbeddingClient { dimensions: 16 });
        let llm_client: Arc<dyn LlmClient> = Arc::new(crate::llm::DeterministicLlmClient);
        let audit: Arc<dyn AuditSink> = Arc::new(InMemoryAuditSink::default());
        let query_orchestrator = Arc::new(QueryOrchestrator::new(
            repo,
            dense,
            sparse,
            embedding_client,
            llm_client.clone(),
            audit,
        ));
        let rag = RagOrchestrator::new(query_orchestrator, llm_client);

        let request_ctx = RequestContext {
            tenant_id: "acme".to_string(),
            api_key_id: "key-1".to_string(),
            role: ApiKeyRole::Read,
            scope_kb_ids: vec![],
            identity: RequestIdentity {
                user: "alice".to_string(),
                roles: vec![],
                groups: vec![],
                clearance: Clearance::Secret,
            },
        };
        (rag, request_ctx, knowledge_base.id)
    }

    #[tokio::test]
    async fn rag_returns_answer_with_sources_and_model_info() {
        let (rag, request_ctx, kb_id) = build_rag_orchestrator().await;
        let llm_config = LlmConfig {
            provider: "deterministic".to_string(),
            model: "llm-default-v1".to_string(),
        };
        let answer = rag
            .answer(
                &request_ctx,
                "what is the refund policy?",
                &[kb_id],
                5,
                None,
                &llm_config,
                GenerationParams::default(),
            )
            .await
            .unwrap();

        assert!(!answer.answer.is_empty());
        assert!(!answer.sources.is_empty());
        assert_eq!(answer.retrieval_count, answer.sources.len());
        assert_eq!(answer.model_info.llm_model.as_deref(), Some("llm-default-v1"));
    }

    #[test]
    fn prompt_preserves_order_and_tags_sources() {
        let hits = vec![
            Hit {
                chunk_id: "c1".to_string(),
                text: "first chunk".to_string(),
                score: 0.9,
                metadata: Default::default(),
                kb_id: "kb1".to_string(),
                doc_id: Some("d1".to_string()),
                source: "dense".to_string(),
                acl: AclMeta {
                    sensitivity_level: SensitivityLevel::Public,
                    acl_allow_users: vec![],
                    acl_allow_roles: vec![],
                    acl_allow_groups: vec![],
                },
            },
            Hit {
                chunk_id: "c2".to_string(),
                text: "second chunk".to_string(),
                score: 0.5,
                metadata: Default::default(),
                kb_id: "kb1".to_string(),
                doc_id: Some("d1".to_string()),
                source: "bm25".to_string(),
                acl: AclMeta {
                    sensitivity_level: SensitivityLevel::Public,
                    acl_allow_users: vec![],
                    acl_allow_roles: vec![],
                    acl_allow_groups: vec![],
                },
            },
        ];
        let prompt = assemble_prompt("q", &hits);
        let first = prompt.find("first chunk").unwrap();
        let second = prompt.find("second chunk").unwrap();
        assert!(first < second);
        assert!(prompt.contains("[dense:c1]"));
        assert!(prompt.contains("[bm25:c2]"));
    }
}
