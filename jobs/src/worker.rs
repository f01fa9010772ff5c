use crate::queue::Job;
use async_trait::async_trait;
use kb_core::model::IndexingStatus;
use kb_storage::repo::Repository;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Re-runs the dense+sparse indexing step for one chunk. Implemented by the
/// ingestion crate, which owns the embedding client and the store adapters;
/// `kb-jobs` only knows how to schedule and retry, not how to index.
#[async_trait]
pub trait IndexingBackend: Send + Sync {
    async fn reindex_chunk(
        &self,
        tenant_id: &str,
        kb_id: &str,
        chunk_id: &str,
    ) -> anyhow::Result<()>;
}

pub struct Worker {
    receiver: mpsc::Receiver<Job>,
    repo: Arc<Repository>,
    backend: Arc<dyn IndexingBackend>,
}

impl Worker {
    pub fn new(
        receiver: mpsc::Receiver<Job>,
        repo: Arc<Repository>,
        backend: Arc<dyn IndexingBackend>,
    ) -> Self {
        Self {
            receiver,
            repo,
            backend,
        }
    }

    pub async fn run(mut self) {
        info!("worker started");
        while let Some(job) = self.receiver.recv().await {
            match job {
                Job::ReindexChunk {
                    tenant_id,
                    kb_id,
                    chunk_id,
                } => {
                    info!(chunk_id = %chunk_id, "reindexing chunk");
                    if let Err(err) = self.process_reindex(&tenant_id, &kb_id, &chunk_id).await {
                        error!(chunk_id = %chunk_id, error = %err, "reindex failed");
                    }
                }
            }
        }
        info!("worker stopped");
    }

    async fn process_reindex(
        &self,
        tenant_id: &str,
        kb_id: &str,
        chunk_id: &str,
    ) -> anyhow::Result<()> {
        let mut chunk = self.repo.get_chunk(chunk_id).await?;

        match self.backend.reindex_chunk(tenant_id, kb_id, chunk_id).await {
            Ok(()) => {
                chunk.indexing_status = IndexingStatus::Indexed;
                chunk.last_error = None;
            }
            Err(err) => {
                chunk.indexing_status = IndexingStatus::Failed;
                chunk.last_error = Some(err.to_string());
            }
        }

        self.repo.put_chunk(chunk).await?;
        Ok(())
    }
}

/// Scans for chunks stuck in `pending` past a threshold and re-enqueues them.
/// Per-chunk "stuck since" is tracked in memory: a chunk seen pending on
/// consecutive scans for longer than `stuck_after` gets re-enqueued once,
/// then the tracker resets so a chunk that is merely slow doesn't get
/// enqueued on every scan tick.
pub struct RecoveryJob {
    repo: Arc<Repository>,
    queue: Arc<dyn crate::queue::JobQueue>,
    scan_interval: Duration,
    stuck_after: Duration,
    first_seen_pending: HashMap<String, Instant>,
}

impl RecoveryJob {
    pub fn new(
        repo: Arc<Repository>,
        queue: Arc<dyn crate::queue::JobQueue>,
        scan_interval: Duration,
        stuck_after: Duration,
    ) -> Self {
        Self {
            repo,
            queue,
            scan_interval,
            stuck_after,
            first_seen_pending: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.scan_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.scan_once().await {
                warn!(error = %err, "recovery scan failed");
            }
        }
    }

    pub async fn scan_once(&mut self) -> anyhow::Result<()> {
        let pending_ids = self.repo.list_pending_chunk_ids().await;
        let now = Instant::now();
        let mut still_pending = HashMap::new();

        for (chunk_id, tenant_id, kb_id) in pending_ids {
            let first_seen = *self
                .first_seen_pending
                .get(&chunk_id)
                .unwrap_or(&now);
            still_pending.insert(chunk_id.clone(), first_seen);

            if now.duration_since(first_seen) >= self.stuck_after {
                info!(chunk_id = %chunk_id, "re-enqueuing stuck chunk");
                self.queue
                    .enqueue(Job::ReindexChunk {
                        tenant_id,
                        kb_id,
                        chunk_id: chunk_id.clone(),
                    })
                    .await?;
                still_pending.remove(&chunk_id);
            }
        }

        self.first_seen_pending = still_pending;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::model::{
        AclLists, Chunk, ChunkerConfig, Document, EmbeddingConfig, KnowledgeBase,
        KnowledgeBaseConfig, RetrieverConfig, SensitivityLevel, SummaryStatus, Tenant,
        TenantQuotas, TenantStatus,
    };
    use std::collections::HashMap as StdHashMap;
    use tempfile::tempdir;
    use tokio::sync::Mutex;

    struct RecordingQueue {
        jobs: Mutex<Vec<Job>>,
    }

    #[async_trait]
    impl crate::queue::JobQueue for RecordingQueue {
        async fn enqueue(&self, job: Job) -> anyhow::Result<()> {
            self.jobs.lock().await.push(job);
            Ok(())
        }
    }

    async fn seed_pending_chunk(repo: &Repository) {
        repo.put_tenant(Tenant {
            id: "acme".into(),
            status: TenantStatus::Active,
            quotas: TenantQuotas::unlimited(),
        })
        .await
        .unwrap();
        repo.put_knowledge_base(KnowledgeBase {
            id: "kb1".into(),
            tenant_id: "acme".into(),
            name: "docs".into(),
            config: KnowledgeBaseConfig {
                chunker: ChunkerConfig {
                    name: "simple".into(),
                    params: serde_json::json!({}),
                },
                retriever: RetrieverConfig {
                    name: "dense".into(),
                    params: serde_json::json!({}),
                },
                embedding: EmbeddingConfig {
                    provider: "deterministic".into(),
                    model: "test".into(),
                    dimensions: 4,
                },
            },
        })
        .await
        .unwrap();
        repo.put_document(Document {
            id: "d1".into(),
            kb_id: "kb1".into(),
            title: "t".into(),
            content: "c".into(),
            sensitivity_level: SensitivityLevel::Internal,
            acl: AclLists::default(),
            summary: None,
            summary_status: SummaryStatus::NotRequested,
            metadata: StdHashMap::new(),
        })
        .await
        .unwrap();
        repo.put_chunk(Chunk {
            id: "c1".into(),
            doc_id: "d1".into(),
            kb_id: "kb1".into(),
            tenant_id: "acme".into(),
            ordinal: 0,
            text: "hello".into(),
            metadata: StdHashMap::new(),
            sensitivity_level: SensitivityLevel::Internal,
            acl: AclLists::default(),
            indexing_status: kb_core::model::IndexingStatus::Pending,
            last_error: None,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn recovery_job_does_not_requeue_before_threshold() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(Repository::open(dir.path().join("recovery.wal")).await.unwrap());
        seed_pending_chunk(&repo).await;

        let queue = Arc::new(RecordingQueue {
            jobs: Mutex::new(vec![]),
        });
        let mut job = RecoveryJob::new(
            repo.clone(),
            queue.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );

        job.scan_once().await.unwrap();
        assert!(queue.jobs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn recovery_job_requeues_after_threshold_elapses() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(Repository::open(dir.path().join("recovery2.wal")).await.unwrap());
        seed_pending_chunk(&repo).await;

        let queue = Arc::new(RecordingQueue {
            jobs: Mutex::new(vec![]),
        });
        let mut job = RecoveryJob::new(
            repo.clone(),
            queue.clone(),
            Duration::from_secs(60),
            Duration::from_millis(1),
        );

        job.scan_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        job.scan_once().await.unwrap();

        let jobs = queue.jobs.lock().await;
        assert_eq!(jobs.len(), 1);
    }
}
