//! Query Orchestrator (§4.6): validates tenant/scope, picks a retriever,
//! checks embedding-config consistency across the requested KBs, executes
//! retrieval, and applies the final ACL trim — the authoritative
//! defense-in-depth pass over whatever the retriever already approximated
//! at hydration time (see `retriever.rs`'s `hydrate_hit`). Every call is an
//! audit event, win or lose.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use kb_core::acl::trim;
use kb_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use kb_core::embedding::EmbeddingClient;
use kb_core::error::{ErrorCode, RetrievalError};
use kb_core::identity::RequestContext;
use kb_core::model::EmbeddingConfig;
use kb_storage::dense::DenseStore;
use kb_storage::repo::{RepoError, Repository};
use kb_storage::sparse::SparseStore;

use crate::llm::LlmClient;
use crate::retriever::{build_retriever, Hit, ParamMode, RetrievalContext, RetrieverError};

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub embedding_provider: String,
    pub embedding_model: String,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub rerank_provider: Option<String>,
    pub rerank_model: Option<String>,
    pub retriever: String,
    pub diagnostics: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub hits: Vec<Hit>,
    pub model_info: ModelInfo,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("knowledge base not found: {0}")]
    NotFound(String),
    #[error("knowledge base {0} is outside the request's scope")]
    PermissionDenied(String),
    #[error("acl trim removed every hit the retriever produced")]
    NoPermission,
    #[error("kb_ids span knowledge bases with differing embedding configs")]
    ConfigMismatch,
    #[error("retriever error: {0}")]
    Retriever(#[from] RetrieverError),
    #[error("repository error: {0}")]
    Repository(#[from] RepoError),
}

impl RetrievalError for QueryError {
    fn error_code(&self) -> ErrorCode {
        match self {
            QueryError::NotFound(_) => ErrorCode::NotFound,
            QueryError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            QueryError::NoPermission => ErrorCode::NoPermission,
            QueryError::ConfigMismatch => ErrorCode::ConfigMismatch,
            QueryError::Retriever(err) => err.error_code(),
            QueryError::Repository(_) => ErrorCode::Internal,
        }
    }
}

pub struct QueryOrchestrator {
    repo: Arc<Repository>,
    dense: Arc<DenseStore>,
    sparse: Arc<SparseStore>,
    embedding_client: Arc<dyn EmbeddingClient>,
    llm_client: Arc<dyn LlmClient>,
    audit: Arc<dyn AuditSink>,
}

impl QueryOrchestrator {
    pub fn new(
        repo: Arc<Repository>,
        dense: Arc<DenseStore>,
        sparse: Arc<SparseStore>,
        embedding_client: Arc<dyn EmbeddingClient>,
        llm_client: Arc<dyn LlmClient>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            repo,
            dense,
            sparse,
            embedding_client,
            llm_client,
            audit,
        }
    }

    pub async fn retrieve(
        &self,
        request_ctx: &RequestContext,
        query: &str,
        kb_ids: &[String],
        top_k: usize,
        retriever_override: Option<&str>,
    ) -> Result<QueryResult, QueryError> {
        let mut kbs = Vec::with_capacity(kb_ids.len());
        for kb_id in kb_ids {
            let kb = match self.repo.get_knowledge_base(kb_id).await {
                Ok(kb) => kb,
                Err(RepoError::NotFound) => {
                    self.audit_failure(request_ctx, kb_ids, "kb not found");
                    return Err(QueryError::NotFound(kb_id.clone()));
                }
                Err(err) => return Err(err.into()),
            };
            // Cross-tenant access is reported as NotFound, never leaking the
            // KB's existence to a tenant that shouldn't see it.
            if kb.tenant_id != request_ctx.tenant_id {
                self.audit_failure(request_ctx, kb_ids, "kb not found");
                return Err(QueryError::NotFound(kb_id.clone()));
            }
            if !request_ctx.in_scope(kb_id) {
                self.audit_failure(request_ctx, kb_ids, "kb out of scope");
                return Err(QueryError::PermissionDenied(kb_id.clone()));
            }
            kbs.push(kb);
        }

        let embedding_config: &EmbeddingConfig = &kbs[0].config.embedding;
        if kbs.iter().any(|kb| &kb.config.embedding != embedding_config) {
            self.audit_failure(request_ctx, kb_ids, "embedding config mismatch");
            return Err(QueryError::ConfigMismatch);
        }

        let (retriever_name, retriever_params) = match retriever_override {
            Some(name) => (name.to_string(), Value::Null),
            None => (
                kbs[0].config.retriever.name.clone(),
                kbs[0].config.retriever.params.clone(),
            ),
        };
        // A configured KB retriever was already validated at KB-creation
        // time; an ad hoc override is accepted leniently so an
        // operator-supplied `retriever_override` name never fails purely on
        // an unrecognized param key.
        let mode = if retriever_override.is_some() {
            ParamMode::Lenient
        } else {
            ParamMode::Strict
        };
        let retriever = build_retriever(&retriever_name, &retriever_params, mode)?;

        let retrieval_ctx = RetrievalContext {
            query,
            tenant_id: &request_ctx.tenant_id,
            kb_ids,
            top_k,
            embedding_config,
            identity: Some(&request_ctx.identity),
            is_admin: request_ctx.is_admin(),
            dense: &self.dense,
            sparse: &self.sparse,
            repo: &self.repo,
            embedding_client: self.embedding_client.as_ref(),
            llm_client: self.llm_client.as_ref(),
        };

        let raw_hits = match retriever.retrieve(&retrieval_ctx).await {
            Ok(hits) => hits,
            Err(err) => {
                self.audit_failure(request_ctx, kb_ids, "retriever error");
                return Err(err.into());
            }
        };
        let produced_any = !raw_hits.is_empty();

        let trimmed = trim(raw_hits, &request_ctx.identity, request_ctx.is_admin());

        if produced_any && trimmed.is_empty() {
            self.audit_event(
                request_ctx,
                kb_ids,
                &retriever_name,
                0,
                AuditOutcome::Denied,
                Some("acl trim emptied a non-empty hit list"),
            );
            return Err(QueryError::NoPermission);
        }

        self.audit_event(
            request_ctx,
            kb_ids,
            &retriever_name,
            trimmed.len(),
            AuditOutcome::Succeeded,
            None,
        );

        let usage = retriever.usage();
        let model_info = ModelInfo {
            embedding_provider: embedding_config.provider.clone(),
            embedding_model: embedding_config.model.clone(),
            llm_provider: usage.llm_provider,
            llm_model: usage.llm_model,
            rerank_provider: usage.rerank_provider,
            rerank_model: usage.rerank_model,
            retriever: retriever_name,
            diagnostics: usage.diagnostics,
        };

        Ok(QueryResult {
            hits: trimmed,
            model_info,
        })
    }

    fn audit_failure(&self, ctx: &RequestContext, kb_ids: &[String], reason: &str) {
        self.audit_event(ctx, kb_ids, "none", 0, AuditOutcome::Failed, Some(reason));
    }

    fn audit_event(
        &self,
        ctx: &RequestContext,
        kb_ids: &[String],
        retriever: &str,
        hit_count: usize,
        outcome: AuditOutcome,
        reason: Option<&str>,
    ) {
        let mut event = AuditEvent::new(AuditOperation::Query, outcome).with_tenant(ctx.tenant_id.clone());
        event.api_key_id = Some(ctx.api_key_id.clone());
        event.metadata.insert("kb_ids".to_string(), kb_ids.join(","));
        event.metadata.insert("retriever".to_string(), retriever.to_string());
        event.metadata.insert("hit_count".to_string(), hit_count.to_string());
        if let Some(reason) = reason {
            event = event.with_reason(reason.to_string());
        }
        let _ = self.audit.record(event);
    }
}
