use async_trait::async_trait;
use kb_core::acl::{chunk_acl_meta, metadata_for_chunk};
use kb_core::ingest::{ContentHash, IngestionRequest};
use kb_core::model::{AclLists, Chunk, Document, IndexingStatus, KnowledgeBase, SensitivityLevel, SummaryStatus};
use kb_jobs::worker::IndexingBackend;
use kb_storage::dense::DenseStore;
use kb_storage::repo::{IndexMutation, RepoError, Repository};
use kb_storage::sparse::{ChunkDocument, SparseStore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::chunker::{build_chunker, ChunkerError, ParamMode};
use crate::embedding::build_embedding_client;
use crate::extract::{detect_content_kind, extract_pdf_text, extract_utf8, ContentKind};
use crate::policy::{ContentPolicy, NoOpPolicy, PolicyError};

const EMBED_MAX_ATTEMPTS: u32 = 3;
const EMBED_BASE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("storage error: {0}")]
    Storage(#[from] RepoError),
    #[error("unsupported content type: {0}")]
    UnsupportedType(String),
    #[error("invalid utf-8 content")]
    InvalidUtf8,
    #[error("content extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("chunker error: {0}")]
    Chunker(#[from] ChunkerError),
    #[error("embedding failed after retries: {0}")]
    EmbeddingFailed(String),
}

/// Result of one `ingest` call: the chunk ids produced, in order, and
/// whether every chunk reached `indexed` (a `false` here means the
/// document is partially indexed; failed chunks carry their own error).
pub struct ChunkingResult {
    pub document_id: String,
    pub chunk_ids: Vec<String>,
    pub fully_indexed: bool,
}

/// Composes chunker -> embedder -> stores per §4.4. Chunker and embedder
/// are resolved per-call from the target KB's config rather than fixed at
/// construction, since each KB may name a different one.
pub struct IngestionPipeline {
    repo: Arc<Repository>,
    dense: Arc<DenseStore>,
    sparse: Arc<SparseStore>,
    policy: Box<dyn ContentPolicy>,
    param_mode: ParamMode,
    /// At-most-one-concurrent-indexing-per-document pool (§5): a keyed
    /// mutex acquired around `ingest`/`reingest`/`delete_document` for a
    /// given document id and released on completion or failure. Concurrent
    /// ingests of *different* documents never contend.
    doc_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IngestionPipeline {
    pub fn new(repo: Arc<Repository>, dense: Arc<DenseStore>, sparse: Arc<SparseStore>) -> Self {
        Self {
            repo,
            dense,
            sparse,
            policy: Box::new(NoOpPolicy),
            param_mode: ParamMode::Lenient,
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for_document(&self, doc_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.doc_locks.lock().await;
        locks.entry(doc_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub fn with_policy(mut self, policy: Box<dyn ContentPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_param_mode(mut self, mode: ParamMode) -> Self {
        self.param_mode = mode;
        self
    }

    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, kb_id = %kb.id))]
    pub async fn ingest(
        &self,
        tenant_id: &str,
        kb: &KnowledgeBase,
        request: IngestionRequest,
    ) -> Result<ChunkingResult, IngestionError> {
        let content_hash = request.content_hash();
        let idempotency_key = request.idempotency_key().map(|k| k.to_string());

        let doc_lock = self.lock_for_document(&derive_document_id(&kb.id, &content_hash)).await;
        let _doc_guard = doc_lock.lock().await;

        if let Some(key) = idempotency_key.as_deref() {
            if let Some(ids) = self.repo.check_idempotency(key).await {
                return Ok(ChunkingResult {
                    document_id: ids.first().cloned().unwrap_or_default(),
                    chunk_ids: ids,
                    fully_indexed: true,
                });
            }
        }
        if let Some(ids) = self.repo.check_idempotency(&content_hash).await {
            return Ok(ChunkingResult {
                document_id: ids.first().cloned().unwrap_or_default(),
                chunk_ids: ids,
                fully_indexed: true,
            });
        }

        let (text, metadata) = extract_request_text(request)?;
        let text = self.policy.apply(&text)?;

        let document = build_document(kb, &content_hash, &text, &metadata);
        self.repo.put_document(document.clone()).await?;

        let result = self.index_document(tenant_id, kb, &document, &metadata_values(metadata)).await?;

        if let Some(key) = &idempotency_key {
            self.repo.record_idempotency(key, result.chunk_ids.clone()).await?;
        }
        self.repo.record_idempotency(&content_hash, result.chunk_ids.clone()).await?;

        Ok(result)
    }

    /// Re-drives the full chunk -> embed -> store pipeline for a document
    /// that is already persisted, per §4.4: deletes its existing chunks
    /// from both stores by chunk-id first, then re-chunks the document's
    /// current content under the KB's *current* chunker/embedding config
    /// and re-indexes. Used when a KB's chunker changed, or to force a
    /// document back to a consistent state after a partial failure.
    #[instrument(skip(self, kb), fields(tenant_id = %tenant_id, kb_id = %kb.id, doc_id = %doc_id))]
    pub async fn reingest(
        &self,
        tenant_id: &str,
        kb: &KnowledgeBase,
        doc_id: &str,
    ) -> Result<ChunkingResult, IngestionError> {
        let doc_lock = self.lock_for_document(doc_id).await;
        let _doc_guard = doc_lock.lock().await;

        let document = self.repo.get_document(doc_id).await?;
        self.clear_old_chunks(tenant_id, &kb.id, doc_id).await?;

        let metadata: HashMap<String, serde_json::Value> =
            document.metadata.iter().map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone()))).collect();
        self.index_document(tenant_id, kb, &document, &metadata).await
    }

    /// Deletes a document and every chunk it owns from the relational
    /// store, the dense store, and the sparse store (§4.4's "re-ingesting
    /// ... first deletes old chunks from both stores by chunk-id", applied
    /// here to a plain delete rather than a delete-then-reindex).
    #[instrument(skip(self), fields(tenant_id = %tenant_id, kb_id = %kb_id, doc_id = %doc_id))]
    pub async fn delete_document(&self, tenant_id: &str, kb_id: &str, doc_id: &str) -> Result<(), IngestionError> {
        let doc_lock = self.lock_for_document(doc_id).await;
        let _doc_guard = doc_lock.lock().await;

        self.clear_old_chunks(tenant_id, kb_id, doc_id).await?;
        self.repo.delete_document(doc_id).await?;
        info!("document deleted");
        Ok(())
    }

    /// Updates a document's sensitivity level and ACL lists and propagates
    /// the change onto every already-persisted chunk row it owns, without
    /// re-embedding. Dense/sparse store entries carry no ACL fields (Open
    /// Question 4 in DESIGN.md); retrievers hydrate ACL state from the
    /// repo's chunk record at query time, so updating it here is all a
    /// sensitivity/ACL change needs to take effect on the next query.
    #[instrument(skip(self, acl), fields(doc_id = %doc_id))]
    pub async fn update_document_acl(
        &self,
        doc_id: &str,
        sensitivity_level: SensitivityLevel,
        acl: AclLists,
    ) -> Result<(), IngestionError> {
        let doc_lock = self.lock_for_document(doc_id).await;
        let _doc_guard = doc_lock.lock().await;

        let mut document = self.repo.get_document(doc_id).await?;
        document.sensitivity_level = sensitivity_level;
        document.acl = acl.clone();
        self.repo.put_document(document).await?;

        let mutations: Vec<IndexMutation> = self
            .repo
            .list_chunks_by_document(doc_id)
            .await
            .into_iter()
            .map(|mut chunk| {
                chunk.sensitivity_level = sensitivity_level;
                chunk.acl = acl.clone();
                IndexMutation::PutChunk(chunk)
            })
            .collect();
        self.repo.apply_index_transaction(mutations).await?;
        Ok(())
    }

    async fn clear_old_chunks(&self, tenant_id: &str, kb_id: &str, doc_id: &str) -> Result<(), IngestionError> {
        let old_ids: Vec<String> =
            self.repo.list_chunks_by_document(doc_id).await.into_iter().map(|c| c.id).collect();
        if old_ids.is_empty() {
            return Ok(());
        }
        self.dense.delete_by_doc(tenant_id, kb_id, &old_ids);
        if let Err(err) = self.sparse.delete_document(tenant_id, kb_id, &old_ids) {
            warn!(error = %err, "sparse delete failed during clear_old_chunks");
        }
        let mutations = old_ids.into_iter().map(IndexMutation::DeleteChunk).collect();
        self.repo.apply_index_transaction(mutations).await?;
        Ok(())
    }

    /// Chunk -> embed -> upsert -> flip-status, shared by `ingest` (for a
    /// newly persisted document) and `reingest` (for one whose old chunks
    /// were just cleared). `document` must already be durably persisted.
    async fn index_document(
        &self,
        tenant_id: &str,
        kb: &KnowledgeBase,
        document: &Document,
        base_metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<ChunkingResult, IngestionError> {
        let chunker = build_chunker(&kb.config.chunker.name, &kb.config.chunker.params, self.param_mode)?;
        let pieces = chunker.chunk(&document.content, base_metadata);

        let acl_meta = metadata_for_chunk(document);
        let chunks = assign_chunk_ids(&document.id, tenant_id, &kb.id, pieces, &acl_meta);

        let pending_mutations = chunks
            .iter()
            .cloned()
            .map(IndexMutation::PutChunk)
            .collect::<Vec<_>>();
        self.repo.apply_index_transaction(pending_mutations).await?;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embed_result = embed_with_retry(&kb.config.embedding, &texts).await;

        let mut final_chunks = chunks;
        let mut fully_indexed = true;

        match embed_result {
            Ok(embeddings) => {
                for (chunk, embedding) in final_chunks.iter_mut().zip(embeddings.into_iter()) {
                    self.dense.upsert(
                        chunk.id.clone(),
                        tenant_id.to_string(),
                        kb.id.clone(),
                        chunk.doc_id.clone(),
                        embedding,
                        chunk_acl_meta(chunk),
                    );
                }
                let docs: Vec<ChunkDocument<'_>> = final_chunks
                    .iter()
                    .map(|c| ChunkDocument {
                        chunk_id: &c.id,
                        tenant_id,
                        kb_id: &kb.id,
                        doc_id: &c.doc_id,
                        text: &c.text,
                        sensitivity_level: c.sensitivity_level,
                        acl_allow_users: &c.acl.allow_users,
                        acl_allow_roles: &c.acl.allow_roles,
                        acl_allow_groups: &c.acl.allow_groups,
                    })
                    .collect();
                if let Err(err) = self.sparse.index_chunks(&docs) {
                    warn!(error = %err, "sparse indexing failed");
                    for chunk in final_chunks.iter_mut() {
                        chunk.indexing_status = IndexingStatus::Failed;
                        chunk.last_error = Some(err.to_string());
                    }
                    fully_indexed = false;
                } else {
                    for chunk in final_chunks.iter_mut() {
                        chunk.indexing_status = IndexingStatus::Indexed;
                        chunk.last_error = None;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "embedding failed after retries");
                for chunk in final_chunks.iter_mut() {
                    chunk.indexing_status = IndexingStatus::Failed;
                    chunk.last_error = Some(err.clone());
                }
                fully_indexed = false;
            }
        }

        let status_mutations = final_chunks
            .iter()
            .cloned()
            .map(IndexMutation::PutChunk)
            .collect::<Vec<_>>();
        self.repo.apply_index_transaction(status_mutations).await?;

        let chunk_ids: Vec<String> = final_chunks.iter().map(|c| c.id.clone()).collect();
        info!(chunk_count = chunk_ids.len(), fully_indexed, "document indexed");
        Ok(ChunkingResult {
            document_id: document.id.clone(),
            chunk_ids,
            fully_indexed,
        })
    }
}

fn metadata_values(metadata: HashMap<String, String>) -> HashMap<String, serde_json::Value> {
    metadata.into_iter().map(|(k, v)| (k, serde_json::Value::String(v))).collect()
}

#[async_trait]
impl IndexingBackend for IngestionPipeline {
    async fn reindex_chunk(&self, tenant_id: &str, kb_id: &str, chunk_id: &str) -> anyhow::Result<()> {
        let chunk = self.repo.get_chunk(chunk_id).await?;
        let kb = self.repo.get_knowledge_base(kb_id).await?;
        let client = build_embedding_client(&kb.config.embedding);
        let embedding = client.embed_one(&chunk.text, &kb.config.embedding.model).await?;
        self.dense.upsert(
            chunk.id.clone(),
            tenant_id.to_string(),
            kb_id.to_string(),
            chunk.doc_id.clone(),
            embedding,
            chunk_acl_meta(&chunk),
        );
        self.sparse.index_chunks(&[ChunkDocument {
            chunk_id: &chunk.id,
            tenant_id,
            kb_id,
            doc_id: &chunk.doc_id,
            text: &chunk.text,
            sensitivity_level: chunk.sensitivity_level,
            acl_allow_users: &chunk.acl.allow_users,
            acl_allow_roles: &chunk.acl.allow_roles,
            acl_allow_groups: &chunk.acl.allow_groups,
        }])?;
        Ok(())
    }
}

fn build_document(
    kb: &KnowledgeBase,
    content_hash: &str,
    text: &str,
    metadata: &HashMap<String, String>,
) -> Document {
    let title = metadata
        .get("filename")
        .cloned()
        .or_else(|| text.lines().next().map(|l| l.chars().take(80).collect()))
        .unwrap_or_else(|| "untitled".to_string());

    Document {
        id: derive_document_id(&kb.id, content_hash),
        kb_id: kb.id.clone(),
        title,
        content: text.to_string(),
        sensitivity_level: SensitivityLevel::Internal,
        acl: AclLists::default(),
        summary: None,
        summary_status: SummaryStatus::NotRequested,
        metadata: metadata.clone(),
    }
}

fn derive_document_id(kb_id: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"doc");
    hasher.update(kb_id.as_bytes());
    hasher.update(content_hash.as_bytes());
    format!("doc_{:x}", hasher.finalize())[..24].to_string()
}

fn derive_chunk_id(doc_id: &str, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"chunk");
    hasher.update(doc_id.as_bytes());
    hasher.update(ordinal.to_le_bytes());
    format!("chunk_{:x}", hasher.finalize())[..27].to_string()
}

/// Assigns real chunk ids to chunker output, inherits ACL metadata from the
/// document, and resolves a parent_child chunker's locally-scoped
/// `local_id`/`parent_local_id` linkage into real `parent_id` values (the
/// chunker itself never sees persisted chunk ids).
fn assign_chunk_ids(
    doc_id: &str,
    tenant_id: &str,
    kb_id: &str,
    pieces: Vec<kb_core::ingest::ChunkPiece>,
    acl_meta: &kb_core::acl::AclMeta,
) -> Vec<Chunk> {
    let mut local_to_real: HashMap<String, String> = HashMap::new();
    let mut chunks: Vec<Chunk> = Vec::with_capacity(pieces.len());

    for (ordinal, piece) in pieces.iter().enumerate() {
        let chunk_id = derive_chunk_id(doc_id, ordinal);
        if let Some(local_id) = piece.metadata.get("local_id").and_then(|v| v.as_str()) {
            local_to_real.insert(local_id.to_string(), chunk_id.clone());
        }
        chunks.push(Chunk {
            id: chunk_id,
            doc_id: doc_id.to_string(),
            kb_id: kb_id.to_string(),
            tenant_id: tenant_id.to_string(),
            ordinal,
            text: piece.text.clone(),
            metadata: piece.metadata.clone(),
            sensitivity_level: acl_meta.sensitivity_level,
            acl: AclLists {
                allow_users: acl_meta.acl_allow_users.clone(),
                allow_roles: acl_meta.acl_allow_roles.clone(),
                allow_groups: acl_meta.acl_allow_groups.clone(),
            },
            indexing_status: IndexingStatus::Pending,
            last_error: None,
        });
    }

    for chunk in chunks.iter_mut() {
        let parent_local = chunk
            .metadata
            .get("parent_local_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        if let Some(local_id) = parent_local {
            if let Some(real_id) = local_to_real.get(&local_id) {
                chunk
                    .metadata
                    .insert("parent_id".to_string(), serde_json::Value::String(real_id.clone()));
            }
            chunk.metadata.remove("parent_local_id");
        }
        chunk.metadata.remove("local_id");
    }

    chunks
}

async fn embed_with_retry(
    config: &kb_core::model::EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, String> {
    let client = build_embedding_client(config);
    let mut attempt = 0u32;
    loop {
        match client.embed_batch(texts, &config.model).await {
            Ok(embeddings) => return Ok(embeddings),
            Err(err) => {
                attempt += 1;
                if attempt >= EMBED_MAX_ATTEMPTS {
                    return Err(err.to_string());
                }
                let backoff = EMBED_BASE_BACKOFF * 2u32.pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn extract_request_text(
    request: IngestionRequest,
) -> Result<(String, HashMap<String, String>), IngestionError> {
    match request {
        IngestionRequest::Text { content, metadata, .. } => Ok((content, metadata)),
        IngestionRequest::File { filename, content, mime_type, mut metadata, .. } => {
            let kind = detect_content_kind(&mime_type, Some(&filename));
            metadata.insert("filename".to_string(), filename);
            metadata.insert("mime_type".to_string(), mime_type.clone());

            match kind {
                ContentKind::Text | ContentKind::Markdown | ContentKind::Json => {
                    let text = extract_utf8(&content).map_err(|_| IngestionError::InvalidUtf8)?;
                    Ok((text, metadata))
                }
                ContentKind::Pdf => {
                    if let Some(text) = extract_pdf_text(&content) {
                        Ok((text, metadata))
                    } else {
                        Err(IngestionError::ExtractionFailed("pdf".to_string()))
                    }
                }
                ContentKind::Unsupported => Err(IngestionError::UnsupportedType(mime_type)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::model::{ChunkerConfig, EmbeddingConfig, KnowledgeBaseConfig, RetrieverConfig, TenantQuotas, TenantStatus};
    use tempfile::tempdir;

    fn test_kb() -> KnowledgeBase {
        KnowledgeBase {
            id: "kb1".into(),
            tenant_id: "acme".into(),
            name: "docs".into(),
            config: KnowledgeBaseConfig {
                chunker: ChunkerConfig {
                    name: "simple".into(),
                    params: serde_json::json!({"max_chars": 20}),
                },
                retriever: RetrieverConfig {
                    name: "dense".into(),
                    params: serde_json::json!({}),
                },
                embedding: EmbeddingConfig {
                    provider: "deterministic".into(),
                    model: "test-v1".into(),
                    dimensions: 8,
                },
            },
        }
    }

    async fn pipeline() -> (tempfile::TempDir, IngestionPipeline) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(Repository::open(dir.path().join("repo.wal")).await.unwrap());
        repo.put_tenant(kb_core::model::Tenant {
            id: "acme".into(),
            status: TenantStatus::Active,
            quotas: TenantQuotas::unlimited(),
        })
        .await
        .unwrap();
        repo.put_knowledge_base(test_kb()).await.unwrap();
        let dense = Arc::new(DenseStore::new());
        let sparse = Arc::new(SparseStore::open(dir.path()).unwrap());
        (dir, IngestionPipeline::new(repo, dense, sparse))
    }

    #[tokio::test]
    async fn ingest_produces_indexed_chunks() {
        let (_dir, pipeline) = pipeline().await;
        let kb = test_kb();
        let request = IngestionRequest::text(
            "a decently long piece of text that should split into more than one chunk".into(),
            HashMap::new(),
        );
        let result = pipeline.ingest("acme", &kb, request).await.unwrap();
        assert!(result.fully_indexed);
        assert!(result.chunk_ids.len() > 1);
    }

    #[tokio::test]
    async fn ingest_is_idempotent_by_key() {
        let (_dir, pipeline) = pipeline().await;
        let kb = test_kb();
        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), "test".to_string());

        let request1 = IngestionRequest::Text {
            content: "same content".into(),
            metadata: metadata.clone(),
            idempotency_key: Some("req-1".into()),
        };
        let first = pipeline.ingest("acme", &kb, request1).await.unwrap();

        let request2 = IngestionRequest::Text {
            content: "same content".into(),
            metadata,
            idempotency_key: Some("req-1".into()),
        };
        let second = pipeline.ingest("acme", &kb, request2).await.unwrap();

        assert_eq!(first.chunk_ids, second.chunk_ids);
    }

    #[tokio::test]
    async fn parent_child_chunks_inherit_resolved_parent_id() {
        let (_dir, pipeline) = pipeline().await;
        let mut kb = test_kb();
        kb.config.chunker = ChunkerConfig {
            name: "parent_child".into(),
            params: serde_json::json!({"parent_max_chars": 100, "child_max_chars": 10}),
        };
        pipeline.repo.put_knowledge_base(kb.clone()).await.unwrap();

        let request = IngestionRequest::text(
            "one two three four five six seven eight nine ten eleven twelve".into(),
            HashMap::new(),
        );
        let result = pipeline.ingest("acme", &kb, request).await.unwrap();

        let mut saw_resolved_parent_id = false;
        for id in &result.chunk_ids {
            let chunk = pipeline.repo.get_chunk(id).await.unwrap();
            if let Some(parent_id) = chunk.metadata.get("parent_id").and_then(|v| v.as_str()) {
                assert!(result.chunk_ids.contains(&parent_id.to_string()));
                saw_resolved_parent_id = true;
            }
        }
        assert!(saw_resolved_parent_id);
    }

    #[tokio::test]
    async fn delete_document_removes_chunks_from_every_store() {
        let (_dir, pipeline) = pipeline().await;
        let kb = test_kb();
        let request = IngestionRequest::text("alpha beta gamma delta epsilon zeta eta theta".into(), HashMap::new());
        let result = pipeline.ingest("acme", &kb, request).await.unwrap();
        assert!(!result.chunk_ids.is_empty());

        pipeline.delete_document("acme", &kb.id, &result.document_id).await.unwrap();

        assert!(pipeline.repo.get_document(&result.document_id).await.is_err());
        for id in &result.chunk_ids {
            assert!(pipeline.repo.get_chunk(id).await.is_err());
            assert!(!pipeline.dense.delete(id));
        }
        let hits = pipeline
            .sparse
            .search_scoped("acme", &kb.id, "alpha beta gamma", 10, &kb_core::acl::Filter::allow_all())
            .unwrap();
        assert!(hits.iter().all(|h| !result.chunk_ids.contains(&h.chunk_id)));
    }

    #[tokio::test]
    async fn reingest_clears_old_chunks_before_rebuilding() {
        let (_dir, pipeline) = pipeline().await;
        let kb = test_kb();
        let request = IngestionRequest::text("one two three four five six seven eight nine ten".into(), HashMap::new());
        let first = pipeline.ingest("acme", &kb, request).await.unwrap();

        let second = pipeline.reingest("acme", &kb, &first.document_id).await.unwrap();

        assert_eq!(first.chunk_ids, second.chunk_ids, "same content + same chunker => same chunk ids");
        assert!(second.fully_indexed);
        for id in &second.chunk_ids {
            let chunk = pipeline.repo.get_chunk(id).await.unwrap();
            assert_eq!(chunk.indexing_status, IndexingStatus::Indexed);
        }
    }

    #[tokio::test]
    async fn update_document_acl_propagates_to_existing_chunks() {
        let (_dir, pipeline) = pipeline().await;
        let kb = test_kb();
        let request = IngestionRequest::text("classified battery roadmap details".into(), HashMap::new());
        let result = pipeline.ingest("acme", &kb, request).await.unwrap();

        pipeline
            .update_document_acl(
                &result.document_id,
                SensitivityLevel::Secret,
                AclLists { allow_roles: vec!["exec".into()], ..Default::default() },
            )
            .await
            .unwrap();

        for id in &result.chunk_ids {
            let chunk = pipeline.repo.get_chunk(id).await.unwrap();
            assert_eq!(chunk.sensitivity_level, SensitivityLevel::Secret);
            assert_eq!(chunk.acl.allow_roles, vec!["exec".to_string()]);
        }
    }

    #[tokio::test]
    async fn concurrent_ingests_of_same_document_serialize_on_the_doc_lock() {
        let (_dir, pipeline) = pipeline().await;
        let pipeline = Arc::new(pipeline);
        let kb = test_kb();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let pipeline = pipeline.clone();
            let kb = kb.clone();
            handles.push(tokio::spawn(async move {
                let request = IngestionRequest::text("shared content for lock contention".into(), HashMap::new());
                pipeline.ingest("acme", &kb, request).await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let first = &results[0];
        for result in &results[1..] {
            assert_eq!(result.document_id, first.document_id);
            assert_eq!(result.chunk_ids, first.chunk_ids);
        }
    }
}
