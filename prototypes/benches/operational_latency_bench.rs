use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Instant;

use kb_core::ingest::IngestionRequest;
use kb_core::model::{
    ChunkerConfig, EmbeddingConfig, KnowledgeBase, KnowledgeBaseConfig, RetrieverConfig, Tenant,
    TenantQuotas, TenantStatus,
};
use kb_ingestion::processor::IngestionPipeline;
use kb_query::orchestrator::QueryOrchestrator;
use kb_storage::dense::DenseStore;
use kb_storage::repo::Repository;
use kb_storage::sparse::SparseStore;

const DIMS: usize = 32;
const MODEL_ID: &str = "embedding-default-v1";

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn percentile_ns(samples: &[u128], p: f64) -> u128 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[rank]
}

fn fmt_ns(ns: u128) -> String {
    if ns >= 1_000_000 {
        format!("{:.3} ms", ns as f64 / 1_000_000.0)
    } else if ns >= 1_000 {
        format!("{:.3} us", ns as f64 / 1_000.0)
    } else {
        format!("{ns} ns")
    }
}

fn bench_kb() -> KnowledgeBase {
    KnowledgeBase {
        id: "kb-bench".to_string(),
        tenant_id: "acme".to_string(),
        name: "bench".to_string(),
        config: KnowledgeBaseConfig {
            chunker: ChunkerConfig {
                name: "simple".to_string(),
                params: serde_json::json!({"max_chars": 400}),
            },
            retriever: RetrieverConfig {
                name: "dense".to_string(),
                params: serde_json::Value::Null,
            },
            embedding: EmbeddingConfig {
                provider: "deterministic".to_string(),
                model: MODEL_ID.to_string(),
                dimensions: DIMS,
            },
        },
    }
}

async fn seed_repo(
    pipeline: &IngestionPipeline,
    kb: &KnowledgeBase,
    doc_count: u64,
) {
    for id in 1..=doc_count {
        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), format!("seed/doc-{id}.md"));
        let content = format!(
            "EV benchmark document {id} covering battery supply chains and market context."
        );
        pipeline
            .ingest(
                "acme",
                kb,
                IngestionRequest::Text {
                    content,
                    metadata,
                    idempotency_key: Some(format!("seed-{id}")),
                },
            )
            .await
            .unwrap();
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let doc_count = env_u64("KB_BENCH_DOCS", 500);
    let workers = env_usize("KB_BENCH_WORKERS", 8);
    let ops_per_worker = env_usize("KB_BENCH_OPS_PER_WORKER", 120);
    let write_every = env_usize("KB_BENCH_WRITE_EVERY", 10).max(1);

    let temp_dir = tempfile::tempdir().unwrap();
    let wal_path = temp_dir.path().join("operational_latency_bench.wal");
    let repo = Arc::new(Repository::open(&wal_path).await.unwrap());
    repo.put_tenant(Tenant {
        id: "acme".into(),
        status: TenantStatus::Active,
        quotas: TenantQuotas::unlimited(),
    })
    .await
    .unwrap();

    let kb = bench_kb();
    repo.put_knowledge_base(kb.clone()).await.unwrap();

    let dense = Arc::new(DenseStore::new());
    let sparse = Arc::new(SparseStore::open(temp_dir.path()).unwrap());
    let pipeline = IngestionPipeline::new(repo.clone(), dense.clone(), sparse.clone());
    seed_repo(&pipeline, &kb, doc_count).await;

    let embedding_client = Arc::new(kb_core::embedding::DeterministicEmbeddingClient { dimensions: DIMS });
    let llm_client: Arc<dyn kb_query::LlmClient> = Arc::new(kb_query::llm::DeterministicLlmClient);
    let audit: Arc<dyn kb_core::audit::AuditSink> = Arc::new(kb_core::audit::InMemoryAuditSink::default());
    let orchestrator = Arc::new(QueryOrchestrator::new(
        repo.clone(),
        dense.clone(),
        sparse.clone(),
        embedding_client,
        llm_client,
        audit,
    ));

    let request_ctx = kb_core::identity::RequestContext {
        tenant_id: "acme".to_string(),
        api_key_id: "bench-key".to_string(),
        role: kb_core::model::ApiKeyRole::Read,
        scope_kb_ids: vec![],
        identity: kb_core::identity::RequestIdentity {
            user: "bench".to_string(),
            roles: vec![],
            groups: vec![],
            clearance: kb_core::model::Clearance::Secret,
        },
    };

    let read_latencies = Arc::new(tokio::sync::Mutex::new(Vec::<u128>::new()));
    let write_latencies = Arc::new(tokio::sync::Mutex::new(Vec::<u128>::new()));

    let scenario_start = Instant::now();
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let pipeline = IngestionPipeline::new(repo.clone(), dense.clone(), sparse.clone());
        let orchestrator = orchestrator.clone();
        let kb = kb.clone();
        let request_ctx = request_ctx.clone();
        let read_latencies = read_latencies.clone();
        let write_latencies = write_latencies.clone();

        let handle = tokio::spawn(async move {
            for op in 0..ops_per_worker {
                if op % write_every == 0 {
                    let mut metadata = HashMap::new();
                    metadata.insert("source".to_string(), format!("runtime/worker-{worker_id}"));

                    let request = IngestionRequest::Text {
                        content: format!(
                            "Runtime ingest worker={worker_id} op={op}: EV battery expansion update."
                        ),
                        metadata,
                        idempotency_key: Some(format!("runtime-{worker_id}-{op}")),
                    };

                    let begin = Instant::now();
                    pipeline.ingest("acme", &kb, request).await.unwrap();
                    let elapsed = begin.elapsed().as_nanos();
                    write_latencies.lock().await.push(elapsed);
                } else {
                    let begin = Instant::now();
                    let _ = orchestrator
                        .retrieve(&request_ctx, "EV battery market", &[kb.id.clone()], 10, None)
                        .await
                        .unwrap();
                    let elapsed = begin.elapsed().as_nanos();
                    read_latencies.lock().await.push(elapsed);
                }
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let total_elapsed = scenario_start.elapsed();
    let read_samples = read_latencies.lock().await.clone();
    let write_samples = write_latencies.lock().await.clone();
    let total_ops = read_samples.len() + write_samples.len();
    let throughput = if total_elapsed.as_secs_f64() > 0.0 {
        total_ops as f64 / total_elapsed.as_secs_f64()
    } else {
        0.0
    };

    println!("=== Operational Latency Benchmark (Retrieve + Ingestion) ===");
    println!(
        "config: seed_docs={}, workers={}, ops_per_worker={}, write_every={} (read:write ~= {}:{})",
        doc_count,
        workers,
        ops_per_worker,
        write_every,
        write_every - 1,
        1
    );
    println!(
        "workload: total_ops={}, read_ops={}, write_ops={}, elapsed={:.3}s, throughput={:.2} ops/s",
        total_ops,
        read_samples.len(),
        write_samples.len(),
        total_elapsed.as_secs_f64(),
        throughput
    );

    println!(
        "read latency: p50={}, p95={}, p99={}",
        fmt_ns(percentile_ns(&read_samples, 0.50)),
        fmt_ns(percentile_ns(&read_samples, 0.95)),
        fmt_ns(percentile_ns(&read_samples, 0.99))
    );
    println!(
        "write latency: p50={}, p95={}, p99={}",
        fmt_ns(percentile_ns(&write_samples, 0.50)),
        fmt_ns(percentile_ns(&write_samples, 0.95)),
        fmt_ns(percentile_ns(&write_samples, 0.99))
    );
}
