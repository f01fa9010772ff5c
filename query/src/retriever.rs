//! Retriever Registry (§4.3): a static name → factory map, mirroring the
//! Chunker Registry's construction discipline in `kb_ingestion::chunker`.
//! Composite retrievers (`fusion`, `hyde`, `multi_query`, `parent_child`)
//! resolve their named base retrievers recursively at construction time, not
//! through a live registry lookup at request time.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use kb_core::acl::{chunk_acl_meta, matches as acl_matches, store_filter, AclCarrier, AclMeta, Filter};
use kb_core::embedding::{EmbeddingClient, EmbeddingError};
use kb_core::error::{ErrorCode, RetrievalError};
use kb_core::identity::RequestIdentity;
use kb_core::model::EmbeddingConfig;
use kb_storage::dense::DenseStore;
use kb_storage::repo::{RepoError, Repository};
use kb_storage::sparse::{SparseError, SparseStore};

use crate::llm::{GenerationParams, LlmClient, LlmConfig, LlmError};

/// Unknown-key handling for retriever params, mirroring
/// `kb_ingestion::chunker::ParamMode` (duplicated rather than depended on:
/// the query crate does not depend on the ingestion crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode {
    Strict,
    Lenient,
}

/// A single retrieval result. `source` identifies which retriever (or leaf
/// of a composite) produced it, used for tie-breaking (§4.3) and ModelInfo
/// diagnostics. `acl` is carried for ACL trim at the Query Orchestrator but
/// never serialized to callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Hit {
    pub chunk_id: String,
    pub text: String,
    pub score: f32,
    pub metadata: HashMap<String, Value>,
    pub kb_id: String,
    pub doc_id: Option<String>,
    pub source: String,
    #[serde(skip)]
    pub acl: AclMeta,
}

impl AclCarrier for Hit {
    fn acl_meta(&self) -> AclMeta {
        self.acl.clone()
    }
}

#[derive(Debug, Error)]
pub enum RetrieverError {
    #[error("unknown retriever: {0}")]
    UnknownRetriever(String),
    #[error("invalid retriever params: {0}")]
    InvalidParams(String),
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("sparse store error: {0}")]
    Sparse(#[from] SparseError),
    #[error("repository error: {0}")]
    Repository(#[from] RepoError),
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
    /// Every sub-retriever (or sub-source) a fan-out retriever fanned out to
    /// failed; a single survivor is enough to avoid this (§7).
    #[error("all sub-retrievers failed: {0}")]
    UpstreamUnavailable(String),
}

impl RetrievalError for RetrieverError {
    fn error_code(&self) -> ErrorCode {
        match self {
            RetrieverError::UnknownRetriever(_) | RetrieverError::InvalidParams(_) => {
                ErrorCode::ValidationError
            }
            RetrieverError::Embedding(e) => e.error_code(),
            RetrieverError::Sparse(e) => e.error_code(),
            RetrieverError::Repository(_) => ErrorCode::Internal,
            RetrieverError::Llm(e) => e.error_code(),
            RetrieverError::UpstreamUnavailable(_) => ErrorCode::UpstreamUnavailable,
        }
    }
}

/// Static facts about what a retriever used to produce its result, surfaced
/// into `ModelInfo` by the Query Orchestrator. Unlike `Hit`, this doesn't
/// depend on the outcome of a particular call: it reflects how the retriever
/// was configured (e.g. whether it wraps an LLM-backed query rewrite or a
/// rerank stage), so it can be read straight off the constructed retriever.
#[derive(Debug, Clone, Default)]
pub struct RetrieverUsage {
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub rerank_provider: Option<String>,
    pub rerank_model: Option<String>,
    pub diagnostics: Value,
}

/// Everything a retriever needs to run one call. Plain references only, so
/// composite retrievers can rebuild a copy with a different `query` (hyde,
/// multi_query) without threading extra parameters through every variant.
#[derive(Clone, Copy)]
pub struct RetrievalContext<'a> {
    pub query: &'a str,
    pub tenant_id: &'a str,
    pub kb_ids: &'a [String],
    pub top_k: usize,
    pub embedding_config: &'a EmbeddingConfig,
    pub identity: Option<&'a RequestIdentity>,
    pub is_admin: bool,
    pub dense: &'a DenseStore,
    pub sparse: &'a SparseStore,
    pub repo: &'a Repository,
    pub embedding_client: &'a dyn EmbeddingClient,
    pub llm_client: &'a dyn LlmClient,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, ctx: &RetrievalContext<'_>) -> Result<Vec<Hit>, RetrieverError>;

    /// What this retriever used to produce its results. Defaults to "used
    /// nothing beyond the embedding model" since most registry entries
    /// (dense, bm25, hybrid, parent_child) don't call an LLM or reranker.
    fn usage(&self) -> RetrieverUsage {
        RetrieverUsage::default()
    }
}

/// Builds the store-side ACL filter for a retrieval call: admins and
/// identity-less (system-internal) calls get the permissive filter, since
/// `hydrate_hit`'s post-check and the Query Orchestrator's final `trim` are
/// the authority on whether those callers actually see a hit.
fn ctx_store_filter(ctx: &RetrievalContext<'_>) -> Filter {
    match ctx.identity {
        Some(identity) if !ctx.is_admin => store_filter(identity),
        _ => Filter::allow_all(),
    }
}

pub trait RerankClient: Send + Sync {
    /// Scores each `(chunk_id, text)` candidate against `query`.
    fn rerank(&self, query: &str, candidates: &[(String, String)]) -> Vec<f32>;
}

/// Deterministic Jaccard-overlap reranker, grounded on the lexical-similarity
/// tokenizer pattern from the teacher's `query::engine.rs`. Used as the
/// default rerank provider since no real rerank API is available here.
pub struct LexicalRerankClient;

impl RerankClient for LexicalRerankClient {
    fn rerank(&self, query: &str, candidates: &[(String, String)]) -> Vec<f32> {
        let query_tokens = tokenize(query);
        candidates
            .iter()
            .map(|(_, text)| lexical_overlap(&query_tokens, &tokenize(text)))
            .collect()
    }
}

/// The registry itself: a static, explicit binding of name → factory.
pub fn build_retriever(
    name: &str,
    params: &Value,
    mode: ParamMode,
) -> Result<Box<dyn Retriever>, RetrieverError> {
    match name {
        "dense" => {
            reject_unknown_keys(params, &[], mode)?;
            Ok(Box::new(DenseRetriever))
        }
        "bm25" => {
            reject_unknown_keys(params, &[], mode)?;
            Ok(Box::new(SparseRetriever))
        }
        "hybrid" => Ok(Box::new(HybridRetriever::from_params(params, mode)?)),
        "fusion" => Ok(Box::new(FusionRetriever::from_params(params, mode)?)),
        "hyde" => Ok(Box::new(HydeRetriever::from_params(params, mode)?)),
        "multi_query" => Ok(Box::new(MultiQueryRetriever::from_params(params, mode)?)),
        "parent_child" => Ok(Box::new(ParentChildRetriever::from_params(params, mode)?)),
        other => Err(RetrieverError::UnknownRetriever(other.to_string())),
    }
}

fn reject_unknown_keys(
    params: &Value,
    allowed: &[&str],
    mode: ParamMode,
) -> Result<(), RetrieverError> {
    if mode == ParamMode::Lenient {
        return Ok(());
    }
    if let Value::Object(map) = params {
        for key in map.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(RetrieverError::InvalidParams(format!(
                    "unknown retriever param: {key}"
                )));
            }
        }
    }
    Ok(())
}

const OVERSAMPLE_FLOOR: usize = 20;

/// The store scoping by (tenant_id, kb_id) already guarantees tenant
/// isolation; this widens the candidate window beyond `top_k` so that
/// ACL hydration (which rejects some candidates after the store call)
/// doesn't starve the final result set.
fn candidate_limit(top_k: usize) -> usize {
    top_k.saturating_mul(4).max(top_k + OVERSAMPLE_FLOOR)
}

/// Fetches the chunk behind a store hit so its text/metadata can be attached
/// to the `Hit`. The store call itself already pushed the ACL filter down
/// (§4.3/§4.5); this re-checks the predicate against the freshly-read chunk
/// as defense in depth (e.g. a document's ACL may have changed since the
/// store's copy was written) and as the only ACL enforcement point for
/// retrievers that don't carry a store-level filter at all (`parent_child`'s
/// synthesized parent hits). `kb_core::acl::trim` at the Query Orchestrator
/// remains the final source of truth. Returns `Ok(None)` for chunks the
/// identity can't see or that no longer exist (e.g. deleted between index
/// and query).
async fn hydrate_hit(
    repo: &Repository,
    chunk_id: &str,
    score: f32,
    source: &str,
    identity: Option<&RequestIdentity>,
    is_admin: bool,
) -> Result<Option<Hit>, RetrieverError> {
    let chunk = match repo.get_chunk(chunk_id).await {
        Ok(chunk) => chunk,
        Err(RepoError::NotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let acl = chunk_acl_meta(&chunk);
    if let Some(identity) = identity {
        if !is_admin && !acl_matches(&acl, identity) {
            return Ok(None);
        }
    }

    Ok(Some(Hit {
        chunk_id: chunk.id,
        text: chunk.text,
        score,
        metadata: chunk.metadata,
        kb_id: chunk.kb_id,
        doc_id: Some(chunk.doc_id),
        source: source.to_string(),
        acl,
    }))
}

fn source_priority(source: &str) -> u8 {
    match source {
        "dense" => 0,
        "bm25" => 1,
        "hybrid" => 2,
        "fusion" => 3,
        "hyde" => 4,
        "multi_query" => 5,
        "parent_child" => 6,
        _ => 255,
    }
}

/// Deterministic ordering for a fixed store state: score desc, then source
/// priority, then ascending chunk_id (§4.3, §5).
fn sort_hits(hits: &mut [Hit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| source_priority(a.source.as_str()).cmp(&source_priority(b.source.as_str())))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let max = scores.iter().cloned().fold(f32::MIN, f32::max);
    let min = scores.iter().cloned().fold(f32::MAX, f32::min);
    if (max - min).abs() < f32::EPSILON {
        let value = if max > 0.0 { 1.0 } else { 0.0 };
        return scores.iter().map(|_| value).collect();
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

fn tokenize(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut buffer = String::new();
    for ch in text.chars().flat_map(|c| c.to_lowercase()) {
        if ch.is_alphanumeric() {
            buffer.push(ch);
        } else if !buffer.is_empty() {
            out.insert(std::mem::take(&mut buffer));
        }
    }
    if !buffer.is_empty() {
        out.insert(buffer);
    }
    out
}

fn lexical_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    intersection / a.len().max(b.len()) as f32
}

fn rrf_merge(per_variant_hits: Vec<Vec<Hit>>, source: &str, k: u32) -> Vec<Hit> {
    let mut combined: HashMap<String, (f32, Hit)> = HashMap::new();
    for hits in per_variant_hits {
        for (rank, hit) in hits.into_iter().enumerate() {
            let contribution = 1.0 / (k as f32 + rank as f32 + 1.0);
            combined
                .entry(hit.chunk_id.clone())
                .and_modify(|(score, _)| *score += contribution)
                .or_insert((contribution, hit));
        }
    }
    let mut hits: Vec<Hit> = combined
        .into_iter()
        .map(|(_, (score, mut hit))| {
            hit.score = score;
            hit.source = source.to_string();
            hit
        })
        .collect();
    sort_hits(&mut hits);
    hits
}

// ---------------------------------------------------------------------
// dense
// ---------------------------------------------------------------------

pub struct DenseRetriever;

#[async_trait]
impl Retriever for DenseRetriever {
    async fn retrieve(&self, ctx: &RetrievalContext<'_>) -> Result<Vec<Hit>, RetrieverError> {
        let embedding = ctx
            .embedding_client
            .embed_one(ctx.query, &ctx.embedding_config.model)
            .await?;
        let limit = candidate_limit(ctx.top_k);
        let filter = ctx_store_filter(ctx);

        let mut hits = Vec::new();
        for kb_id in ctx.kb_ids {
            let raw = ctx.dense.search(ctx.tenant_id, kb_id, &embedding, limit, &filter);
            for candidate in raw {
                if let Some(hit) = hydrate_hit(
                    ctx.repo,
                    &candidate.chunk_id,
                    candidate.score,
                    "dense",
                    ctx.identity,
                    ctx.is_admin,
                )
                .await?
                {
                    hits.push(hit);
                }
            }
        }

        sort_hits(&mut hits);
        hits.truncate(ctx.top_k);
        Ok(hits)
    }
}

// ---------------------------------------------------------------------
// bm25 (sparse)
// ---------------------------------------------------------------------

pub struct SparseRetriever;

#[async_trait]
impl Retriever for SparseRetriever {
    async fn retrieve(&self, ctx: &RetrievalContext<'_>) -> Result<Vec<Hit>, RetrieverError> {
        let limit = candidate_limit(ctx.top_k);
        let filter = ctx_store_filter(ctx);
        let mut raw: Vec<(String, f32)> = Vec::new();
        for kb_id in ctx.kb_ids {
            raw.extend(
                ctx.sparse
                    .search_scoped(ctx.tenant_id, kb_id, ctx.query, limit, &filter)?
                    .into_iter()
                    .map(|hit| (hit.chunk_id, hit.score)),
            );
        }

        let scores: Vec<f32> = raw.iter().map(|(_, s)| *s).collect();
        let normalized = min_max_normalize(&scores);

        let mut hits = Vec::new();
        for ((chunk_id, _), score) in raw.into_iter().zip(normalized) {
            if let Some(hit) =
                hydrate_hit(ctx.repo, &chunk_id, score, "bm25", ctx.identity, ctx.is_admin).await?
            {
                hits.push(hit);
            }
        }

        sort_hits(&mut hits);
        hits.truncate(ctx.top_k);
        Ok(hits)
    }
}

// ---------------------------------------------------------------------
// hybrid
// ---------------------------------------------------------------------

pub struct HybridRetriever {
    pub dense_weight: f32,
    pub sparse_weight: f32,
}

impl HybridRetriever {
    fn from_params(params: &Value, mode: ParamMode) -> Result<Self, RetrieverError> {
        reject_unknown_keys(params, &["dense_weight", "sparse_weight"], mode)?;
        let dense_weight = params
            .get("dense_weight")
            .and_then(Value::as_f64)
            .unwrap_or(0.5) as f32;
        let sparse_weight = params
            .get("sparse_weight")
            .and_then(Value::as_f64)
            .unwrap_or(0.5) as f32;
        Ok(Self {
            dense_weight,
            sparse_weight,
        })
    }
}

#[async_trait]
impl Retriever for HybridRetriever {
    async fn retrieve(&self, ctx: &RetrievalContext<'_>) -> Result<Vec<Hit>, RetrieverError> {
        let limit = candidate_limit(ctx.top_k);
        let filter = ctx_store_filter(ctx);
        let embedding = ctx
            .embedding_client
            .embed_one(ctx.query, &ctx.embedding_config.model)
            .await?;

        let mut dense_raw: Vec<(String, f32)> = Vec::new();
        for kb_id in ctx.kb_ids {
            dense_raw.extend(
                ctx.dense
                    .search(ctx.tenant_id, kb_id, &embedding, limit, &filter)
                    .into_iter()
                    .map(|hit| (hit.chunk_id, hit.score)),
            );
        }

        // The dense store's search is infallible; sparse's is (Tantivy I/O,
        // query parse). §7 requires tolerating a single source's failure
        // rather than aborting hybrid retrieval outright, so a sparse
        // failure is logged and treated as an empty leg instead of `?`.
        let mut sparse_raw: Vec<(String, f32)> = Vec::new();
        let mut sparse_failed = false;
        for kb_id in ctx.kb_ids {
            match ctx.sparse.search_scoped(ctx.tenant_id, kb_id, ctx.query, limit, &filter) {
                Ok(hits) => sparse_raw.extend(hits.into_iter().map(|hit| (hit.chunk_id, hit.score))),
                Err(err) => {
                    sparse_failed = true;
                    tracing::warn!(error = %err, kb_id, "sparse leg of hybrid retrieval failed, proceeding with dense only");
                }
            }
        }
        if sparse_failed && dense_raw.is_empty() {
            return Err(RetrieverError::UpstreamUnavailable(
                "both dense and sparse legs of hybrid retrieval produced nothing".to_string(),
            ));
        }

        let dense_norm = min_max_normalize(&dense_raw.iter().map(|(_, s)| *s).collect::<Vec<_>>());
        let sparse_norm = min_max_normalize(&sparse_raw.iter().map(|(_, s)| *s).collect::<Vec<_>>());

        let mut combined: HashMap<String, f32> = HashMap::new();
        for ((chunk_id, _), norm) in dense_raw.into_iter().zip(dense_norm) {
            let contribution = self.dense_weight * norm;
            combined
                .entry(chunk_id)
                .and_modify(|s| *s += contribution)
                .or_insert(contribution);
        }
        for ((chunk_id, _), norm) in sparse_raw.into_iter().zip(sparse_norm) {
            let contribution = self.sparse_weight * norm;
            combined
                .entry(chunk_id)
                .and_modify(|s| *s += contribution)
                .or_insert(contribution);
        }

        let mut hits = Vec::new();
        for (chunk_id, score) in combined {
            if let Some(hit) =
                hydrate_hit(ctx.repo, &chunk_id, score, "hybrid", ctx.identity, ctx.is_admin).await?
            {
                hits.push(hit);
            }
        }

        sort_hits(&mut hits);
        hits.truncate(ctx.top_k);
        Ok(hits)
    }
}

// ---------------------------------------------------------------------
// fusion
// ---------------------------------------------------------------------

pub struct FusionRetriever {
    pub sub_retrievers: Vec<Box<dyn Retriever>>,
    pub rrf_k: u32,
    pub weights: Option<Vec<f32>>,
    pub rerank_top_n: Option<usize>,
    pub rerank_client: Option<Arc<dyn RerankClient>>,
}

impl FusionRetriever {
    fn from_params(params: &Value, mode: ParamMode) -> Result<Self, RetrieverError> {
        reject_unknown_keys(params, &["retrievers", "k", "weights", "rerank_top_n"], mode)?;

        let entries = params
            .get("retrievers")
            .and_then(Value::as_array)
            .filter(|arr| !arr.is_empty())
            .ok_or_else(|| {
                RetrieverError::InvalidParams("fusion requires a non-empty retrievers array".to_string())
            })?;

        let mut sub_retrievers = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = entry.get("name").and_then(Value::as_str).ok_or_else(|| {
                RetrieverError::InvalidParams("fusion sub-retriever missing name".to_string())
            })?;
            let sub_params = entry.get("params").cloned().unwrap_or(Value::Null);
            sub_retrievers.push(build_retriever(name, &sub_params, mode)?);
        }

        let rrf_k = params.get("k").and_then(Value::as_u64).unwrap_or(60) as u32;
        let weights = params.get("weights").and_then(Value::as_array).map(|arr| {
            arr.iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect::<Vec<_>>()
        });
        let rerank_top_n = params.get("rerank_top_n").and_then(Value::as_u64).map(|v| v as usize);
        let rerank_client = rerank_top_n.map(|_| Arc::new(LexicalRerankClient) as Arc<dyn RerankClient>);

        Ok(Self {
            sub_retrievers,
            rrf_k,
            weights,
            rerank_top_n,
            rerank_client,
        })
    }
}

#[async_trait]
impl Retriever for FusionRetriever {
    async fn retrieve(&self, ctx: &RetrievalContext<'_>) -> Result<Vec<Hit>, RetrieverError> {
        // §7: tolerate a single sub-retriever failing by proceeding with the
        // survivors; only error, as UpstreamUnavailable, if every one of
        // them failed. `idx` is kept alongside each surviving result so
        // weight lookup below still lines up with the original retriever
        // list instead of the post-filter position.
        let mut per_retriever: Vec<(usize, Vec<Hit>)> = Vec::with_capacity(self.sub_retrievers.len());
        for (idx, retriever) in self.sub_retrievers.iter().enumerate() {
            match retriever.retrieve(ctx).await {
                Ok(hits) => per_retriever.push((idx, hits)),
                Err(err) => {
                    tracing::warn!(error = %err, sub_retriever = idx, "fusion sub-retriever failed, proceeding with survivors");
                }
            }
        }
        if per_retriever.is_empty() && !self.sub_retrievers.is_empty() {
            return Err(RetrieverError::UpstreamUnavailable(
                "all fusion sub-retrievers failed".to_string(),
            ));
        }

        let mut combined: HashMap<String, (f32, Hit)> = HashMap::new();
        for (idx, hits) in per_retriever {
            let weight = self.weights.as_ref().and_then(|w| w.get(idx)).copied();
            for (rank, hit) in hits.into_iter().enumerate() {
                let contribution = match weight {
                    Some(w) => w * hit.score,
                    None => 1.0 / (self.rrf_k as f32 + rank as f32 + 1.0),
                };
                combined
                    .entry(hit.chunk_id.clone())
                    .and_modify(|(score, _)| *score += contribution)
                    .or_insert((contribution, hit));
            }
        }

        let mut hits: Vec<Hit> = combined
            .into_iter()
            .map(|(_, (score, mut hit))| {
                hit.score = score;
                hit.source = "fusion".to_string();
                hit
            })
            .collect();
        sort_hits(&mut hits);

        if let (Some(top_n), Some(rerank_client)) = (self.rerank_top_n, &self.rerank_client) {
            let scope = top_n.min(hits.len());
            if scope > 0 {
                let candidates: Vec<(String, String)> = hits[..scope]
                    .iter()
                    .map(|hit| (hit.chunk_id.clone(), hit.text.clone()))
                    .collect();
                let rerank_scores = rerank_client.rerank(ctx.query, &candidates);
                for (hit, score) in hits[..scope].iter_mut().zip(rerank_scores) {
                    hit.score = score;
                }
            }
            sort_hits(&mut hits);
        }

        hits.truncate(ctx.top_k);
        Ok(hits)
    }

    fn usage(&self) -> RetrieverUsage {
        let mut usage = self
            .sub_retrievers
            .iter()
            .map(|r| r.usage())
            .find(|u| u.llm_provider.is_some())
            .unwrap_or_default();
        if self.rerank_client.is_some() {
            usage.rerank_provider = Some("lexical".to_string());
            usage.rerank_model = Some("jaccard-overlap-v1".to_string());
        }
        usage.diagnostics = serde_json::json!({
            "sub_retrievers": self.sub_retrievers.len(),
            "rrf_k": self.rrf_k,
        });
        usage
    }
}

// ---------------------------------------------------------------------
// hyde
// ---------------------------------------------------------------------

pub struct HydeRetriever {
    pub base: Box<dyn Retriever>,
    pub num_queries: usize,
    pub include_original: bool,
    pub llm_config: LlmConfig,
}

impl HydeRetriever {
    fn from_params(params: &Value, mode: ParamMode) -> Result<Self, RetrieverError> {
        reject_unknown_keys(
            params,
            &["base", "base_params", "num_queries", "include_original", "llm_provider", "llm_model"],
            mode,
        )?;
        let base_name = params.get("base").and_then(Value::as_str).unwrap_or("dense");
        let base_params = params.get("base_params").cloned().unwrap_or(Value::Null);
        let base = build_retriever(base_name, &base_params, mode)?;
        let num_queries = params.get("num_queries").and_then(Value::as_u64).unwrap_or(3) as usize;
        let include_original = params
            .get("include_original")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let llm_config = LlmConfig {
            provider: params
                .get("llm_provider")
                .and_then(Value::as_str)
                .unwrap_or("deterministic")
                .to_string(),
            model: params
                .get("llm_model")
                .and_then(Value::as_str)
                .unwrap_or("llm-default-v1")
                .to_string(),
        };
        Ok(Self {
            base,
            num_queries,
            include_original,
            llm_config,
        })
    }
}

#[async_trait]
impl Retriever for HydeRetriever {
    async fn retrieve(&self, ctx: &RetrievalContext<'_>) -> Result<Vec<Hit>, RetrieverError> {
        let params = GenerationParams::default();
        let mut hypotheticals = Vec::with_capacity(self.num_queries + 1);
        for i in 0..self.num_queries {
            let prompt = format!("Write a hypothetical answer to: {}\n[variant {i}]", ctx.query);
            hypotheticals.push(
                ctx.llm_client
                    .complete(&prompt, &self.llm_config, &params)
                    .await?,
            );
        }
        if self.include_original {
            hypotheticals.push(ctx.query.to_string());
        }

        let mut per_hypothetical = Vec::with_capacity(hypotheticals.len());
        for hypothesis in &hypotheticals {
            let sub_ctx = RetrievalContext {
                query: hypothesis.as_str(),
                ..*ctx
            };
            per_hypothetical.push(self.base.retrieve(&sub_ctx).await?);
        }

        let mut hits = rrf_merge(per_hypothetical, "hyde", 60);
        let diagnostics = Value::Array(hypotheticals.into_iter().map(Value::String).collect());
        for hit in &mut hits {
            hit.metadata.insert("hyde_queries".to_string(), diagnostics.clone());
        }
        hits.truncate(ctx.top_k);
        Ok(hits)
    }

    fn usage(&self) -> RetrieverUsage {
        RetrieverUsage {
            llm_provider: Some(self.llm_config.provider.clone()),
            llm_model: Some(self.llm_config.model.clone()),
            diagnostics: serde_json::json!({
                "num_queries": self.num_queries,
                "include_original": self.include_original,
            }),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------
// multi_query
// ---------------------------------------------------------------------

pub struct MultiQueryRetriever {
    pub base: Box<dyn Retriever>,
    pub num_queries: usize,
    pub llm_config: LlmConfig,
}

impl MultiQueryRetriever {
    fn from_params(params: &Value, mode: ParamMode) -> Result<Self, RetrieverError> {
        reject_unknown_keys(
            params,
            &["base", "base_params", "num_queries", "llm_provider", "llm_model"],
            mode,
        )?;
        let base_name = params.get("base").and_then(Value::as_str).unwrap_or("dense");
        let base_params = params.get("base_params").cloned().unwrap_or(Value::Null);
        let base = build_retriever(base_name, &base_params, mode)?;
        let num_queries = params.get("num_queries").and_then(Value::as_u64).unwrap_or(3) as usize;
        let llm_config = LlmConfig {
            provider: params
                .get("llm_provider")
                .and_then(Value::as_str)
                .unwrap_or("deterministic")
                .to_string(),
            model: params
                .get("llm_model")
                .and_then(Value::as_str)
                .unwrap_or("llm-default-v1")
                .to_string(),
        };
        Ok(Self {
            base,
            num_queries,
            llm_config,
        })
    }
}

#[async_trait]
impl Retriever for MultiQueryRetriever {
    async fn retrieve(&self, ctx: &RetrievalContext<'_>) -> Result<Vec<Hit>, RetrieverError> {
        let params = GenerationParams::default();
        let mut variants = Vec::with_capacity(self.num_queries);
        for i in 0..self.num_queries {
            let prompt = format!("Rewrite this search query differently: {}\n[variant {i}]", ctx.query);
            variants.push(
                ctx.llm_client
                    .complete(&prompt, &self.llm_config, &params)
                    .await?,
            );
        }

        let mut per_variant = Vec::with_capacity(variants.len());
        for variant in &variants {
            let sub_ctx = RetrievalContext {
                query: variant.as_str(),
                ..*ctx
            };
            per_variant.push(self.base.retrieve(&sub_ctx).await?);
        }

        let mut hits = rrf_merge(per_variant, "multi_query", 60);
        let diagnostics = Value::Array(variants.into_iter().map(Value::String).collect());
        for hit in &mut hits {
            hit.metadata.insert("query_variants".to_string(), diagnostics.clone());
        }
        hits.truncate(ctx.top_k);
        Ok(hits)
    }

    fn usage(&self) -> RetrieverUsage {
        RetrieverUsage {
            llm_provider: Some(self.llm_config.provider.clone()),
            llm_model: Some(self.llm_config.model.clone()),
            diagnostics: serde_json::json!({ "num_queries": self.num_queries }),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------
// parent_child
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentChildMode {
    Replace,
    Attach,
}

pub struct ParentChildRetriever {
    pub base: Box<dyn Retriever>,
    pub mode: ParentChildMode,
}

impl ParentChildRetriever {
    fn from_params(params: &Value, mode: ParamMode) -> Result<Self, RetrieverError> {
        reject_unknown_keys(params, &["base", "base_params", "mode"], mode)?;
        let base_name = params.get("base").and_then(Value::as_str).unwrap_or("dense");
        let base_params = params.get("base_params").cloned().unwrap_or(Value::Null);
        let base = build_retriever(base_name, &base_params, mode)?;
        let pc_mode = match params.get("mode").and_then(Value::as_str) {
            Some("attach") => ParentChildMode::Attach,
            _ => ParentChildMode::Replace,
        };
        Ok(Self { base, mode: pc_mode })
    }
}

#[async_trait]
impl Retriever for ParentChildRetriever {
    async fn retrieve(&self, ctx: &RetrievalContext<'_>) -> Result<Vec<Hit>, RetrieverError> {
        let hits = self.base.retrieve(ctx).await?;
        let child_hits: Vec<Hit> = hits
            .into_iter()
            .filter(|hit| hit.metadata.get("child").and_then(Value::as_bool).unwrap_or(false))
            .collect();

        match self.mode {
            ParentChildMode::Attach => {
                let mut out = Vec::with_capacity(child_hits.len());
                for mut hit in child_hits {
                    if let Some(parent_id) = hit
                        .metadata
                        .get("parent_id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                    {
                        if let Some(parent) = hydrate_hit(
                            ctx.repo,
                            &parent_id,
                            hit.score,
                            "parent_child",
                            ctx.identity,
                            ctx.is_admin,
                        )
                        .await?
                        {
                            hit.metadata.insert("parent_text".to_string(), Value::String(parent.text));
                        }
                    }
                    hit.source = "parent_child".to_string();
                    out.push(hit);
                }
                sort_hits(&mut out);
                out.truncate(ctx.top_k);
                Ok(out)
            }
            ParentChildMode::Replace => {
                let mut by_parent: HashMap<String, Hit> = HashMap::new();
                for hit in child_hits {
                    let Some(parent_id) = hit
                        .metadata
                        .get("parent_id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                    else {
                        continue;
                    };
                    let Some(mut parent_hit) = hydrate_hit(
                        ctx.repo,
                        &parent_id,
                        hit.score,
                        "parent_child",
                        ctx.identity,
                        ctx.is_admin,
                    )
                    .await?
                    else {
                        continue;
                    };
                    by_parent
                        .entry(parent_hit.chunk_id.clone())
                        .and_modify(|existing| {
                            if parent_hit.score > existing.score {
                                std::mem::swap(existing, &mut parent_hit);
                            }
                        })
                        .or_insert(parent_hit);
                }
                let mut out: Vec<Hit> = by_parent.into_values().collect();
                sort_hits(&mut out);
                out.truncate(ctx.top_k);
                Ok(out)
            }
        }
    }

    fn usage(&self) -> RetrieverUsage {
        self.base.usage()
    }
}
