use crate::crypto::{AtRestCipher, NoOpCipher};
use crate::snapshot::{SnapshotError, SnapshotManager};
use crate::wal::{Wal, WalError};
use kb_core::model::{
    AclLists, AdminToken, ApiKey, ApiKeyRole, Chunk, Clearance, Identity, IndexingStatus,
    KnowledgeBase, SensitivityLevel, Tenant, TenantQuotas, TenantStatus,
};
use rkyv::ser::{serializers::AllocSerializer, Serializer};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("Serialization error")]
    Serialization,
    #[error("Deserialization error")]
    Deserialization,
    #[error("Not found")]
    NotFound,
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("Snapshot manager is not configured")]
    SnapshotNotConfigured,
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

// rkyv can't archive `serde_json::Value` or the domain enums directly, so the
// WAL stores flat records that mirror the core model and convert at the
// repository boundary -- the same split the teacher used for its
// `BackupEdgeRecord`/`BackupIdempotencyRecord` backup types.

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct StoredTenant {
    pub id: String,
    pub status: u8,
    pub kb_count: i64,
    pub doc_count: i64,
    pub storage_mb: i64,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct StoredApiKey {
    pub id: String,
    pub tenant_id: String,
    pub hashed_key: String,
    pub prefix: String,
    pub role: u8,
    pub scope_restricted: bool,
    pub scope_kb_ids: Vec<String>,
    pub identity_user: String,
    pub identity_roles: Vec<String>,
    pub identity_groups: Vec<String>,
    pub clearance: u8,
    pub rate_limit_per_minute: Option<u32>,
    pub revoked: bool,
    pub expires_at: Option<u64>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct StoredKnowledgeBase {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub config_json: String,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct StoredDocument {
    pub id: String,
    pub kb_id: String,
    pub title: String,
    pub content: String,
    pub sensitivity_level: u8,
    pub allow_users: Vec<String>,
    pub allow_roles: Vec<String>,
    pub allow_groups: Vec<String>,
    pub summary: Option<String>,
    pub summary_status: u8,
    pub metadata: HashMap<String, String>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct StoredChunk {
    pub id: String,
    pub doc_id: String,
    pub kb_id: String,
    pub tenant_id: String,
    pub ordinal: u64,
    pub text: String,
    pub metadata_json: String,
    pub sensitivity_level: u8,
    pub allow_users: Vec<String>,
    pub allow_roles: Vec<String>,
    pub allow_groups: Vec<String>,
    pub indexing_status: u8,
    pub last_error: Option<String>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct StoredAdminToken {
    pub id: String,
    pub hashed_token: String,
    pub prefix: String,
    pub revoked: bool,
    pub expires_at: Option<u64>,
}

fn tenant_status_to_u8(status: TenantStatus) -> u8 {
    match status {
        TenantStatus::Active => 0,
        TenantStatus::Disabled => 1,
        TenantStatus::Pending => 2,
    }
}

fn tenant_status_from_u8(value: u8) -> Result<TenantStatus, RepoError> {
    match value {
        0 => Ok(TenantStatus::Active),
        1 => Ok(TenantStatus::Disabled),
        2 => Ok(TenantStatus::Pending),
        _ => Err(RepoError::Deserialization),
    }
}

fn role_to_u8(role: ApiKeyRole) -> u8 {
    match role {
        ApiKeyRole::Admin => 0,
        ApiKeyRole::Write => 1,
        ApiKeyRole::Read => 2,
    }
}

fn role_from_u8(value: u8) -> Result<ApiKeyRole, RepoError> {
    match value {
        0 => Ok(ApiKeyRole::Admin),
        1 => Ok(ApiKeyRole::Write),
        2 => Ok(ApiKeyRole::Read),
        _ => Err(RepoError::Deserialization),
    }
}

fn clearance_to_u8(clearance: Clearance) -> u8 {
    match clearance {
        Clearance::Public => 0,
        Clearance::Internal => 1,
        Clearance::Confidential => 2,
        Clearance::Secret => 3,
    }
}

fn clearance_from_u8(value: u8) -> Result<Clearance, RepoError> {
    match value {
        0 => Ok(Clearance::Public),
        1 => Ok(Clearance::Internal),
        2 => Ok(Clearance::Confidential),
        3 => Ok(Clearance::Secret),
        _ => Err(RepoError::Deserialization),
    }
}

fn sensitivity_to_u8(level: SensitivityLevel) -> u8 {
    match level {
        SensitivityLevel::Public => 0,
        SensitivityLevel::Internal => 1,
        SensitivityLevel::Confidential => 2,
        SensitivityLevel::Secret => 3,
    }
}

fn sensitivity_from_u8(value: u8) -> Result<SensitivityLevel, RepoError> {
    match value {
        0 => Ok(SensitivityLevel::Public),
        1 => Ok(SensitivityLevel::Internal),
        2 => Ok(SensitivityLevel::Confidential),
        3 => Ok(SensitivityLevel::Secret),
        _ => Err(RepoError::Deserialization),
    }
}

fn summary_status_to_u8(status: kb_core::model::SummaryStatus) -> u8 {
    use kb_core::model::SummaryStatus::*;
    match status {
        NotRequested => 0,
        Pending => 1,
        Ready => 2,
        Failed => 3,
    }
}

fn summary_status_from_u8(value: u8) -> Result<kb_core::model::SummaryStatus, RepoError> {
    use kb_core::model::SummaryStatus::*;
    match value {
        0 => Ok(NotRequested),
        1 => Ok(Pending),
        2 => Ok(Ready),
        3 => Ok(Failed),
        _ => Err(RepoError::Deserialization),
    }
}

fn indexing_status_to_u8(status: IndexingStatus) -> u8 {
    match status {
        IndexingStatus::Pending => 0,
        IndexingStatus::Indexed => 1,
        IndexingStatus::Failed => 2,
    }
}

fn indexing_status_from_u8(value: u8) -> Result<IndexingStatus, RepoError> {
    match value {
        0 => Ok(IndexingStatus::Pending),
        1 => Ok(IndexingStatus::Indexed),
        2 => Ok(IndexingStatus::Failed),
        _ => Err(RepoError::Deserialization),
    }
}

impl From<&Tenant> for StoredTenant {
    fn from(tenant: &Tenant) -> Self {
        Self {
            id: tenant.id.clone(),
            status: tenant_status_to_u8(tenant.status),
            kb_count: tenant.quotas.kb_count,
            doc_count: tenant.quotas.doc_count,
            storage_mb: tenant.quotas.storage_mb,
        }
    }
}

impl TryFrom<StoredTenant> for Tenant {
    type Error = RepoError;
    fn try_from(stored: StoredTenant) -> Result<Self, RepoError> {
        Ok(Self {
            id: stored.id,
            status: tenant_status_from_u8(stored.status)?,
            quotas: TenantQuotas {
                kb_count: stored.kb_count,
                doc_count: stored.doc_count,
                storage_mb: stored.storage_mb,
            },
        })
    }
}

impl From<&ApiKey> for StoredApiKey {
    fn from(key: &ApiKey) -> Self {
        Self {
            id: key.id.clone(),
            tenant_id: key.tenant_id.clone(),
            hashed_key: key.hashed_key.clone(),
            prefix: key.prefix.clone(),
            role: role_to_u8(key.role),
            scope_restricted: key.scope_kb_ids.is_some(),
            scope_kb_ids: key.scope_kb_ids.clone().unwrap_or_default(),
            identity_user: key.identity.user.clone(),
            identity_roles: key.identity.roles.clone(),
            identity_groups: key.identity.groups.clone(),
            clearance: clearance_to_u8(key.clearance),
            rate_limit_per_minute: key.rate_limit_per_minute,
            revoked: key.revoked,
            expires_at: key.expires_at,
        }
    }
}

impl TryFrom<StoredApiKey> for ApiKey {
    type Error = RepoError;
    fn try_from(stored: StoredApiKey) -> Result<Self, RepoError> {
        Ok(Self {
            id: stored.id,
            tenant_id: stored.tenant_id,
            hashed_key: stored.hashed_key,
            prefix: stored.prefix,
            role: role_from_u8(stored.role)?,
            scope_kb_ids: stored.scope_restricted.then_some(stored.scope_kb_ids),
            identity: Identity {
                user: stored.identity_user,
                roles: stored.identity_roles,
                groups: stored.identity_groups,
            },
            clearance: clearance_from_u8(stored.clearance)?,
            rate_limit_per_minute: stored.rate_limit_per_minute,
            revoked: stored.revoked,
            expires_at: stored.expires_at,
        })
    }
}

impl TryFrom<&KnowledgeBase> for StoredKnowledgeBase {
    type Error = RepoError;
    fn try_from(kb: &KnowledgeBase) -> Result<Self, RepoError> {
        Ok(Self {
            id: kb.id.clone(),
            tenant_id: kb.tenant_id.clone(),
            name: kb.name.clone(),
            config_json: serde_json::to_string(&kb.config).map_err(|_| RepoError::Serialization)?,
        })
    }
}

impl TryFrom<StoredKnowledgeBase> for KnowledgeBase {
    type Error = RepoError;
    fn try_from(stored: StoredKnowledgeBase) -> Result<Self, RepoError> {
        Ok(Self {
            id: stored.id,
            tenant_id: stored.tenant_id,
            name: stored.name,
            config: serde_json::from_str(&stored.config_json)
                .map_err(|_| RepoError::Deserialization)?,
        })
    }
}

impl From<&kb_core::model::Document> for StoredDocument {
    fn from(doc: &kb_core::model::Document) -> Self {
        Self {
            id: doc.id.clone(),
            kb_id: doc.kb_id.clone(),
            title: doc.title.clone(),
            content: doc.content.clone(),
            sensitivity_level: sensitivity_to_u8(doc.sensitivity_level),
            allow_users: doc.acl.allow_users.clone(),
            allow_roles: doc.acl.allow_roles.clone(),
            allow_groups: doc.acl.allow_groups.clone(),
            summary: doc.summary.clone(),
            summary_status: summary_status_to_u8(doc.summary_status),
            metadata: doc.metadata.clone(),
        }
    }
}

impl TryFrom<StoredDocument> for kb_core::model::Document {
    type Error = RepoError;
    fn try_from(stored: StoredDocument) -> Result<Self, RepoError> {
        Ok(Self {
            id: stored.id,
            kb_id: stored.kb_id,
            title: stored.title,
            content: stored.content,
            sensitivity_level: sensitivity_from_u8(stored.sensitivity_level)?,
            acl: AclLists {
                allow_users: stored.allow_users,
                allow_roles: stored.allow_roles,
                allow_groups: stored.allow_groups,
            },
            summary: stored.summary,
            summary_status: summary_status_from_u8(stored.summary_status)?,
            metadata: stored.metadata,
        })
    }
}

impl TryFrom<&Chunk> for StoredChunk {
    type Error = RepoError;
    fn try_from(chunk: &Chunk) -> Result<Self, RepoError> {
        Ok(Self {
            id: chunk.id.clone(),
            doc_id: chunk.doc_id.clone(),
            kb_id: chunk.kb_id.clone(),
            tenant_id: chunk.tenant_id.clone(),
            ordinal: chunk.ordinal as u64,
            text: chunk.text.clone(),
            metadata_json: serde_json::to_string(&chunk.metadata)
                .map_err(|_| RepoError::Serialization)?,
            sensitivity_level: sensitivity_to_u8(chunk.sensitivity_level),
            allow_users: chunk.acl.allow_users.clone(),
            allow_roles: chunk.acl.allow_roles.clone(),
            allow_groups: chunk.acl.allow_groups.clone(),
            indexing_status: indexing_status_to_u8(chunk.indexing_status),
            last_error: chunk.last_error.clone(),
        })
    }
}

impl TryFrom<StoredChunk> for Chunk {
    type Error = RepoError;
    fn try_from(stored: StoredChunk) -> Result<Self, RepoError> {
        Ok(Self {
            id: stored.id,
            doc_id: stored.doc_id,
            kb_id: stored.kb_id,
            tenant_id: stored.tenant_id,
            ordinal: stored.ordinal as usize,
            text: stored.text,
            metadata: serde_json::from_str(&stored.metadata_json)
                .map_err(|_| RepoError::Deserialization)?,
            sensitivity_level: sensitivity_from_u8(stored.sensitivity_level)?,
            acl: AclLists {
                allow_users: stored.allow_users,
                allow_roles: stored.allow_roles,
                allow_groups: stored.allow_groups,
            },
            indexing_status: indexing_status_from_u8(stored.indexing_status)?,
            last_error: stored.last_error,
        })
    }
}

impl From<&AdminToken> for StoredAdminToken {
    fn from(token: &AdminToken) -> Self {
        Self {
            id: token.id.clone(),
            hashed_token: token.hashed_token.clone(),
            prefix: token.prefix.clone(),
            revoked: token.revoked,
            expires_at: token.expires_at,
        }
    }
}

impl From<StoredAdminToken> for AdminToken {
    fn from(stored: StoredAdminToken) -> Self {
        Self {
            id: stored.id,
            hashed_token: stored.hashed_token,
            prefix: stored.prefix,
            revoked: stored.revoked,
            expires_at: stored.expires_at,
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub enum WalEntry {
    IdempotencyKey { key: String, chunk_ids: Vec<String> },
    Transaction(Vec<TxOperation>),
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub enum TxOperation {
    PutTenant(StoredTenant),
    PutApiKey(StoredApiKey),
    PutKnowledgeBase(StoredKnowledgeBase),
    PutDocument(StoredDocument),
    PutChunk(StoredChunk),
    PutAdminToken(StoredAdminToken),
    DeleteTenant(String),
    DeleteApiKey(String),
    DeleteKnowledgeBase(String),
    DeleteDocument(String),
    DeleteChunk(String),
    DeleteAdminToken(String),
}

/// A single change to apply atomically. One `apply_index_transaction` call
/// commits all of these in one WAL record or none at all.
#[derive(Debug, Clone)]
pub enum IndexMutation {
    PutTenant(Tenant),
    PutApiKey(ApiKey),
    PutKnowledgeBase(KnowledgeBase),
    PutDocument(kb_core::model::Document),
    PutChunk(Chunk),
    PutAdminToken(AdminToken),
    DeleteTenant(String),
    DeleteApiKey(String),
    DeleteKnowledgeBase(String),
    DeleteDocument(String),
    DeleteChunk(String),
    DeleteAdminToken(String),
}

#[derive(Default)]
struct MaterializedState {
    tenants: HashMap<String, Tenant>,
    api_keys: HashMap<String, ApiKey>,
    knowledge_bases: HashMap<String, KnowledgeBase>,
    documents: HashMap<String, kb_core::model::Document>,
    chunks: HashMap<String, Chunk>,
    admin_tokens: HashMap<String, AdminToken>,
    idempotency_index: HashMap<String, Vec<String>>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
struct BackupIdempotencyRecord {
    key: String,
    chunk_ids: Vec<String>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
struct RepositoryBackupSnapshot {
    lsn: u64,
    tenants: Vec<StoredTenant>,
    api_keys: Vec<StoredApiKey>,
    knowledge_bases: Vec<StoredKnowledgeBase>,
    documents: Vec<StoredDocument>,
    chunks: Vec<StoredChunk>,
    admin_tokens: Vec<StoredAdminToken>,
    idempotency: Vec<BackupIdempotencyRecord>,
}

pub struct Repository {
    wal: Arc<Mutex<Wal>>,
    tx_lock: Arc<Mutex<()>>,
    tenants: Arc<RwLock<HashMap<String, Tenant>>>,
    api_keys: Arc<RwLock<HashMap<String, ApiKey>>>,
    knowledge_bases: Arc<RwLock<HashMap<String, KnowledgeBase>>>,
    documents: Arc<RwLock<HashMap<String, kb_core::model::Document>>>,
    chunks: Arc<RwLock<HashMap<String, Chunk>>>,
    admin_tokens: Arc<RwLock<HashMap<String, AdminToken>>>,
    idempotency_index: Arc<RwLock<HashMap<String, Vec<String>>>>,
    snapshot_manager: Option<SnapshotManager>,
}

impl Repository {
    pub async fn open(wal_path: impl AsRef<Path>) -> Result<Self, RepoError> {
        Self::open_with_cipher(wal_path, Arc::new(NoOpCipher)).await
    }

    pub async fn open_with_cipher(
        wal_path: impl AsRef<Path>,
        cipher: Arc<dyn AtRestCipher>,
    ) -> Result<Self, RepoError> {
        Self::open_internal(wal_path.as_ref().to_path_buf(), cipher, None).await
    }

    pub async fn open_with_snapshots(
        wal_path: impl AsRef<Path>,
        snapshot_dir: impl AsRef<Path>,
    ) -> Result<Self, RepoError> {
        Self::open_with_cipher_and_snapshots(wal_path, Arc::new(NoOpCipher), snapshot_dir).await
    }

    pub async fn open_with_cipher_and_snapshots(
        wal_path: impl AsRef<Path>,
        cipher: Arc<dyn AtRestCipher>,
        snapshot_dir: impl AsRef<Path>,
    ) -> Result<Self, RepoError> {
        let snapshot_manager = SnapshotManager::new(snapshot_dir.as_ref());
        Self::open_internal(
            wal_path.as_ref().to_path_buf(),
            cipher,
            Some(snapshot_manager),
        )
        .await
    }

    async fn open_internal(
        wal_path: PathBuf,
        cipher: Arc<dyn AtRestCipher>,
        snapshot_manager: Option<SnapshotManager>,
    ) -> Result<Self, RepoError> {
        let wal_instance = Wal::open_with_cipher(&wal_path, cipher).await?;
        let wal = Arc::new(Mutex::new(wal_instance));
        let tx_lock = Arc::new(Mutex::new(()));
        let (mut materialized, base_lsn) =
            load_materialized_state_from_backup(snapshot_manager.as_ref(), None).await?;

        {
            let mut wal_lock = wal.lock().await;
            let last_replayed_lsn = wal_lock
                .replay(|lsn, data| {
                    if lsn <= base_lsn {
                        return Ok(());
                    }
                    let archived = rkyv::check_archived_root::<WalEntry>(&data[..])
                        .map_err(|_| WalError::CorruptEntry)?;
                    let entry: WalEntry = archived
                        .deserialize(&mut rkyv::Infallible)
                        .map_err(|_: std::convert::Infallible| WalError::CorruptEntry)?;
                    apply_replayed_entry(&entry, &mut materialized)
                        .map_err(|_| WalError::CorruptEntry)?;
                    Ok(())
                })
                .await?;

            if base_lsn > last_replayed_lsn {
                return Err(RepoError::SnapshotNotFound(format!("wal-lsn-{base_lsn}")));
            }
        }

        Ok(Self {
            wal,
            tx_lock,
            tenants: Arc::new(RwLock::new(materialized.tenants)),
            api_keys: Arc::new(RwLock::new(materialized.api_keys)),
            knowledge_bases: Arc::new(RwLock::new(materialized.knowledge_bases)),
            documents: Arc::new(RwLock::new(materialized.documents)),
            chunks: Arc::new(RwLock::new(materialized.chunks)),
            admin_tokens: Arc::new(RwLock::new(materialized.admin_tokens)),
            idempotency_index: Arc::new(RwLock::new(materialized.idempotency_index)),
            snapshot_manager,
        })
    }

    pub async fn put_tenant(&self, tenant: Tenant) -> Result<(), RepoError> {
        self.apply_index_transaction(vec![IndexMutation::PutTenant(tenant)]).await
    }

    pub async fn put_api_key(&self, key: ApiKey) -> Result<(), RepoError> {
        self.apply_index_transaction(vec![IndexMutation::PutApiKey(key)]).await
    }

    pub async fn put_knowledge_base(&self, kb: KnowledgeBase) -> Result<(), RepoError> {
        self.apply_index_transaction(vec![IndexMutation::PutKnowledgeBase(kb)]).await
    }

    pub async fn put_document(&self, doc: kb_core::model::Document) -> Result<(), RepoError> {
        self.apply_index_transaction(vec![IndexMutation::PutDocument(doc)]).await
    }

    pub async fn put_chunk(&self, chunk: Chunk) -> Result<(), RepoError> {
        self.apply_index_transaction(vec![IndexMutation::PutChunk(chunk)]).await
    }

    pub async fn put_admin_token(&self, token: AdminToken) -> Result<(), RepoError> {
        self.apply_index_transaction(vec![IndexMutation::PutAdminToken(token)]).await
    }

    pub async fn get_tenant(&self, id: &str) -> Result<Tenant, RepoError> {
        self.tenants.read().await.get(id).cloned().ok_or(RepoError::NotFound)
    }

    pub async fn get_api_key_by_hash(&self, hashed_key: &str) -> Option<ApiKey> {
        self.api_keys
            .read()
            .await
            .values()
            .find(|key| key.hashed_key == hashed_key)
            .cloned()
    }

    pub async fn get_knowledge_base(&self, id: &str) -> Result<KnowledgeBase, RepoError> {
        self.knowledge_bases.read().await.get(id).cloned().ok_or(RepoError::NotFound)
    }

    pub async fn get_document(&self, id: &str) -> Result<kb_core::model::Document, RepoError> {
        self.documents.read().await.get(id).cloned().ok_or(RepoError::NotFound)
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Chunk, RepoError> {
        self.chunks.read().await.get(id).cloned().ok_or(RepoError::NotFound)
    }

    pub async fn list_chunks_by_document(&self, doc_id: &str) -> Vec<Chunk> {
        let chunks = self.chunks.read().await;
        let mut out: Vec<Chunk> = chunks.values().filter(|c| c.doc_id == doc_id).cloned().collect();
        out.sort_by_key(|c| c.ordinal);
        out
    }

    pub async fn list_knowledge_bases_by_tenant(&self, tenant_id: &str) -> Vec<KnowledgeBase> {
        self.knowledge_bases
            .read()
            .await
            .values()
            .filter(|kb| kb.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub async fn count_knowledge_bases(&self, tenant_id: &str) -> i64 {
        self.knowledge_bases
            .read()
            .await
            .values()
            .filter(|kb| kb.tenant_id == tenant_id)
            .count() as i64
    }

    pub async fn count_documents(&self, kb_id: &str) -> i64 {
        self.documents.read().await.values().filter(|d| d.kb_id == kb_id).count() as i64
    }

    /// Returns (chunk_id, tenant_id, kb_id) for every chunk currently pending.
    /// Used by the recovery job to find indexing attempts that never completed.
    pub async fn list_pending_chunk_ids(&self) -> Vec<(String, String, String)> {
        self.chunks
            .read()
            .await
            .values()
            .filter(|c| c.indexing_status == IndexingStatus::Pending)
            .map(|c| (c.id.clone(), c.tenant_id.clone(), c.kb_id.clone()))
            .collect()
    }

    pub async fn delete_document(&self, id: &str) -> Result<(), RepoError> {
        let chunk_ids: Vec<String> = {
            let chunks = self.chunks.read().await;
            chunks.values().filter(|c| c.doc_id == id).map(|c| c.id.clone()).collect()
        };
        let mut mutations: Vec<IndexMutation> =
            chunk_ids.into_iter().map(IndexMutation::DeleteChunk).collect();
        mutations.push(IndexMutation::DeleteDocument(id.to_string()));
        self.apply_index_transaction(mutations).await
    }

    /// Apply index updates atomically within one transaction boundary.
    /// If validation fails, nothing is written to WAL or in-memory state.
    pub async fn apply_index_transaction(
        &self,
        mutations: Vec<IndexMutation>,
    ) -> Result<(), RepoError> {
        if mutations.is_empty() {
            return Ok(());
        }

        let _tx_guard = self.tx_lock.lock().await;

        self.validate_index_transaction(&mutations).await?;

        let tx_operations = mutations_to_tx_operations(&mutations)?;
        let tx_entry = WalEntry::Transaction(tx_operations);
        let tx_bytes = serialize_wal_entry(&tx_entry)?;

        {
            let mut wal = self.wal.lock().await;
            wal.append(&tx_bytes).await?;
            wal.flush().await?;
        }

        let mut tenants = self.tenants.write().await;
        let mut api_keys = self.api_keys.write().await;
        let mut knowledge_bases = self.knowledge_bases.write().await;
        let mut documents = self.documents.write().await;
        let mut chunks = self.chunks.write().await;
        let mut admin_tokens = self.admin_tokens.write().await;

        for mutation in mutations {
            apply_mutation(
                mutation,
                &mut tenants,
                &mut api_keys,
                &mut knowledge_bases,
                &mut documents,
                &mut chunks,
                &mut admin_tokens,
            );
        }

        Ok(())
    }

    pub async fn check_idempotency(&self, key: &str) -> Option<Vec<String>> {
        self.idempotency_index.read().await.get(key).cloned()
    }

    pub async fn record_idempotency(&self, key: &str, chunk_ids: Vec<String>) -> Result<(), RepoError> {
        let mut index = self.idempotency_index.write().await;
        if index.contains_key(key) {
            return Ok(());
        }

        let entry = WalEntry::IdempotencyKey {
            key: key.to_string(),
            chunk_ids: chunk_ids.clone(),
        };
        let bytes = serialize_wal_entry(&entry)?;

        {
            let mut wal = self.wal.lock().await;
            wal.append(&bytes).await?;
            wal.flush().await?;
        }

        index.insert(key.to_string(), chunk_ids);
        Ok(())
    }

    pub async fn current_snapshot_id(&self) -> String {
        let wal = self.wal.lock().await;
        format!("wal-lsn-{}", wal.current_lsn())
    }

    pub async fn create_backup_snapshot(&self) -> Result<String, RepoError> {
        let snapshot_manager = self
            .snapshot_manager
            .as_ref()
            .ok_or(RepoError::SnapshotNotConfigured)?;

        let snapshot = {
            let _tx_guard = self.tx_lock.lock().await;

            let lsn = {
                let wal = self.wal.lock().await;
                wal.current_lsn()
            };

            let mut tenants: Vec<StoredTenant> =
                self.tenants.read().await.values().map(StoredTenant::from).collect();
            tenants.sort_by(|a, b| a.id.cmp(&b.id));

            let mut api_keys: Vec<StoredApiKey> =
                self.api_keys.read().await.values().map(StoredApiKey::from).collect();
            api_keys.sort_by(|a, b| a.id.cmp(&b.id));

            let mut knowledge_bases: Vec<StoredKnowledgeBase> = self
                .knowledge_bases
                .read()
                .await
                .values()
                .map(StoredKnowledgeBase::try_from)
                .collect::<Result<_, _>>()?;
            knowledge_bases.sort_by(|a, b| a.id.cmp(&b.id));

            let mut documents: Vec<StoredDocument> =
                self.documents.read().await.values().map(StoredDocument::from).collect();
            documents.sort_by(|a, b| a.id.cmp(&b.id));

            let mut chunks: Vec<StoredChunk> = self
                .chunks
                .read()
                .await
                .values()
                .map(StoredChunk::try_from)
                .collect::<Result<_, _>>()?;
            chunks.sort_by(|a, b| a.id.cmp(&b.id));

            let mut admin_tokens: Vec<StoredAdminToken> =
                self.admin_tokens.read().await.values().map(StoredAdminToken::from).collect();
            admin_tokens.sort_by(|a, b| a.id.cmp(&b.id));

            let mut idempotency: Vec<BackupIdempotencyRecord> = self
                .idempotency_index
                .read()
                .await
                .iter()
                .map(|(key, chunk_ids)| BackupIdempotencyRecord {
                    key: key.clone(),
                    chunk_ids: chunk_ids.clone(),
                })
                .collect();
            idempotency.sort_by(|a, b| a.key.cmp(&b.key));

            RepositoryBackupSnapshot {
                lsn,
                tenants,
                api_keys,
                knowledge_bases,
                documents,
                chunks,
                admin_tokens,
                idempotency,
            }
        };

        let encoded = serialize_backup_snapshot(&snapshot)?;
        snapshot_manager.create_snapshot(snapshot.lsn, &encoded).await?;

        Ok(format!("wal-lsn-{}", snapshot.lsn))
    }

    pub async fn restore_from_latest_backup(&self) -> Result<String, RepoError> {
        if self.snapshot_manager.is_none() {
            return Err(RepoError::SnapshotNotConfigured);
        }

        let _tx_guard = self.tx_lock.lock().await;
        let target_lsn = {
            let wal = self.wal.lock().await;
            wal.current_lsn()
        };

        let (mut materialized, base_lsn) =
            load_materialized_state_from_backup(self.snapshot_manager.as_ref(), Some(target_lsn))
                .await?;

        {
            let mut wal = self.wal.lock().await;
            wal.replay(|lsn, data| {
                if lsn <= base_lsn || lsn > target_lsn {
                    return Ok(());
                }
                let archived = rkyv::check_archived_root::<WalEntry>(&data[..])
                    .map_err(|_| WalError::CorruptEntry)?;
                let entry: WalEntry = archived
                    .deserialize(&mut rkyv::Infallible)
                    .map_err(|_: std::convert::Infallible| WalError::CorruptEntry)?;
                apply_replayed_entry(&entry, &mut materialized).map_err(|_| WalError::CorruptEntry)?;
                Ok(())
            })
            .await?;
        }

        *self.tenants.write().await = materialized.tenants;
        *self.api_keys.write().await = materialized.api_keys;
        *self.knowledge_bases.write().await = materialized.knowledge_bases;
        *self.documents.write().await = materialized.documents;
        *self.chunks.write().await = materialized.chunks;
        *self.admin_tokens.write().await = materialized.admin_tokens;
        *self.idempotency_index.write().await = materialized.idempotency_index;

        Ok(format!("wal-lsn-{target_lsn}"))
    }

    async fn validate_index_transaction(&self, mutations: &[IndexMutation]) -> Result<(), RepoError> {
        let tenants = self.tenants.read().await;
        let knowledge_bases = self.knowledge_bases.read().await;
        let documents = self.documents.read().await;
        let chunks = self.chunks.read().await;
        let api_keys = self.api_keys.read().await;
        let admin_tokens = self.admin_tokens.read().await;

        let mut visible_tenants: std::collections::HashSet<String> = tenants.keys().cloned().collect();
        let mut visible_kbs: std::collections::HashSet<String> = knowledge_bases.keys().cloned().collect();
        let mut visible_docs: std::collections::HashSet<String> = documents.keys().cloned().collect();
        let mut visible_chunks: std::collections::HashSet<String> = chunks.keys().cloned().collect();
        let mut visible_keys: std::collections::HashSet<String> = api_keys.keys().cloned().collect();
        let mut visible_tokens: std::collections::HashSet<String> = admin_tokens.keys().cloned().collect();

        for mutation in mutations {
            match mutation {
                IndexMutation::PutTenant(tenant) => {
                    visible_tenants.insert(tenant.id.clone());
                }
                IndexMutation::PutApiKey(key) => {
                    if !visible_tenants.contains(&key.tenant_id) {
                        return Err(RepoError::InvalidTransaction(format!(
                            "api key references unknown tenant {}",
                            key.tenant_id
                        )));
                    }
                    visible_keys.insert(key.id.clone());
                }
                IndexMutation::PutKnowledgeBase(kb) => {
                    if !visible_tenants.contains(&kb.tenant_id) {
                        return Err(RepoError::InvalidTransaction(format!(
                            "knowledge base references unknown tenant {}",
                            kb.tenant_id
                        )));
                    }
                    visible_kbs.insert(kb.id.clone());
                }
                IndexMutation::PutDocument(doc) => {
                    if !visible_kbs.contains(&doc.kb_id) {
                        return Err(RepoError::InvalidTransaction(format!(
                            "document references unknown knowledge base {}",
                            doc.kb_id
                        )));
                    }
                    visible_docs.insert(doc.id.clone());
                }
                IndexMutation::PutChunk(chunk) => {
                    if !visible_docs.contains(&chunk.doc_id) {
                        return Err(RepoError::InvalidTransaction(format!(
                            "chunk references unknown document {}",
                            chunk.doc_id
                        )));
                    }
                    visible_chunks.insert(chunk.id.clone());
                }
                IndexMutation::PutAdminToken(token) => {
                    visible_tokens.insert(token.id.clone());
                }
                IndexMutation::DeleteTenant(id) => {
                    if !visible_tenants.remove(id) {
                        return Err(RepoError::NotFound);
                    }
                }
                IndexMutation::DeleteApiKey(id) => {
                    if !visible_keys.remove(id) {
                        return Err(RepoError::NotFound);
                    }
                }
                IndexMutation::DeleteKnowledgeBase(id) => {
                    if !visible_kbs.remove(id) {
                        return Err(RepoError::NotFound);
                    }
                }
                IndexMutation::DeleteDocument(id) => {
                    if !visible_docs.remove(id) {
                        return Err(RepoError::NotFound);
                    }
                }
                IndexMutation::DeleteChunk(id) => {
                    if !visible_chunks.remove(id) {
                        return Err(RepoError::NotFound);
                    }
                }
                IndexMutation::DeleteAdminToken(id) => {
                    if !visible_tokens.remove(id) {
                        return Err(RepoError::NotFound);
                    }
                }
            }
        }

        Ok(())
    }
}

fn apply_mutation(
    mutation: IndexMutation,
    tenants: &mut HashMap<String, Tenant>,
    api_keys: &mut HashMap<String, ApiKey>,
    knowledge_bases: &mut HashMap<String, KnowledgeBase>,
    documents: &mut HashMap<String, kb_core::model::Document>,
    chunks: &mut HashMap<String, Chunk>,
    admin_tokens: &mut HashMap<String, AdminToken>,
) {
    match mutation {
        IndexMutation::PutTenant(tenant) => {
            tenants.insert(tenant.id.clone(), tenant);
        }
        IndexMutation::PutApiKey(key) => {
            api_keys.insert(key.id.clone(), key);
        }
        IndexMutation::PutKnowledgeBase(kb) => {
            knowledge_bases.insert(kb.id.clone(), kb);
        }
        IndexMutation::PutDocument(doc) => {
            documents.insert(doc.id.clone(), doc);
        }
        IndexMutation::PutChunk(chunk) => {
            chunks.insert(chunk.id.clone(), chunk);
        }
        IndexMutation::PutAdminToken(token) => {
            admin_tokens.insert(token.id.clone(), token);
        }
        IndexMutation::DeleteTenant(id) => {
            tenants.remove(&id);
        }
        IndexMutation::DeleteApiKey(id) => {
            api_keys.remove(&id);
        }
        IndexMutation::DeleteKnowledgeBase(id) => {
            knowledge_bases.remove(&id);
        }
        IndexMutation::DeleteDocument(id) => {
            documents.remove(&id);
        }
        IndexMutation::DeleteChunk(id) => {
            chunks.remove(&id);
        }
        IndexMutation::DeleteAdminToken(id) => {
            admin_tokens.remove(&id);
        }
    }
}

fn mutations_to_tx_operations(mutations: &[IndexMutation]) -> Result<Vec<TxOperation>, RepoError> {
    mutations
        .iter()
        .map(|mutation| {
            Ok(match mutation {
                IndexMutation::PutTenant(t) => TxOperation::PutTenant(StoredTenant::from(t)),
                IndexMutation::PutApiKey(k) => TxOperation::PutApiKey(StoredApiKey::from(k)),
                IndexMutation::PutKnowledgeBase(kb) => {
                    TxOperation::PutKnowledgeBase(StoredKnowledgeBase::try_from(kb)?)
                }
                IndexMutation::PutDocument(d) => TxOperation::PutDocument(StoredDocument::from(d)),
                IndexMutation::PutChunk(c) => TxOperation::PutChunk(StoredChunk::try_from(c)?),
                IndexMutation::PutAdminToken(t) => TxOperation::PutAdminToken(StoredAdminToken::from(t)),
                IndexMutation::DeleteTenant(id) => TxOperation::DeleteTenant(id.clone()),
                IndexMutation::DeleteApiKey(id) => TxOperation::DeleteApiKey(id.clone()),
                IndexMutation::DeleteKnowledgeBase(id) => TxOperation::DeleteKnowledgeBase(id.clone()),
                IndexMutation::DeleteDocument(id) => TxOperation::DeleteDocument(id.clone()),
                IndexMutation::DeleteChunk(id) => TxOperation::DeleteChunk(id.clone()),
                IndexMutation::DeleteAdminToken(id) => TxOperation::DeleteAdminToken(id.clone()),
            })
        })
        .collect()
}

fn serialize_wal_entry(entry: &WalEntry) -> Result<Vec<u8>, RepoError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer
        .serialize_value(entry)
        .map_err(|_| RepoError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

fn serialize_backup_snapshot(snapshot: &RepositoryBackupSnapshot) -> Result<Vec<u8>, RepoError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer
        .serialize_value(snapshot)
        .map_err(|_| RepoError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

async fn deserialize_backup_snapshot(path: &Path) -> Result<RepositoryBackupSnapshot, RepoError> {
    let bytes = fs::read(path)
        .await
        .map_err(|err| RepoError::Snapshot(SnapshotError::Io(err)))?;
    let archived = rkyv::check_archived_root::<RepositoryBackupSnapshot>(&bytes[..])
        .map_err(|_| RepoError::Deserialization)?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_: std::convert::Infallible| RepoError::Deserialization)
}

async fn load_materialized_state_from_backup(
    snapshot_manager: Option<&SnapshotManager>,
    target_lsn: Option<u64>,
) -> Result<(MaterializedState, u64), RepoError> {
    let Some(manager) = snapshot_manager else {
        return Ok((MaterializedState::default(), 0));
    };

    let selected = match target_lsn {
        Some(lsn) => manager.latest_snapshot_at_or_before(lsn).await?,
        None => manager.latest_snapshot().await?,
    };

    let Some((snapshot_lsn, path)) = selected else {
        return Ok((MaterializedState::default(), 0));
    };

    let snapshot = deserialize_backup_snapshot(&path).await?;
    if snapshot.lsn != snapshot_lsn {
        return Err(RepoError::Deserialization);
    }

    let mut materialized = MaterializedState::default();
    for tenant in snapshot.tenants {
        let tenant = Tenant::try_from(tenant)?;
        materialized.tenants.insert(tenant.id.clone(), tenant);
    }
    for key in snapshot.api_keys {
        let key = ApiKey::try_from(key)?;
        materialized.api_keys.insert(key.id.clone(), key);
    }
    for kb in snapshot.knowledge_bases {
        let kb = KnowledgeBase::try_from(kb)?;
        materialized.knowledge_bases.insert(kb.id.clone(), kb);
    }
    for doc in snapshot.documents {
        let doc = kb_core::model::Document::try_from(doc)?;
        materialized.documents.insert(doc.id.clone(), doc);
    }
    for chunk in snapshot.chunks {
        let chunk = Chunk::try_from(chunk)?;
        materialized.chunks.insert(chunk.id.clone(), chunk);
    }
    for token in snapshot.admin_tokens {
        let token = AdminToken::from(token);
        materialized.admin_tokens.insert(token.id.clone(), token);
    }
    for record in snapshot.idempotency {
        materialized.idempotency_index.insert(record.key, record.chunk_ids);
    }

    Ok((materialized, snapshot_lsn))
}

fn apply_replayed_entry(entry: &WalEntry, state: &mut MaterializedState) -> Result<(), RepoError> {
    match entry {
        WalEntry::IdempotencyKey { key, chunk_ids } => {
            state.idempotency_index.insert(key.clone(), chunk_ids.clone());
        }
        WalEntry::Transaction(operations) => {
            for operation in operations {
                apply_replayed_tx_operation(operation, state)?;
            }
        }
    }
    Ok(())
}

fn apply_replayed_tx_operation(operation: &TxOperation, state: &mut MaterializedState) -> Result<(), RepoError> {
    match operation {
        TxOperation::PutTenant(t) => {
            let tenant = Tenant::try_from(t.clone())?;
            state.tenants.insert(tenant.id.clone(), tenant);
        }
        TxOperation::PutApiKey(k) => {
            let key = ApiKey::try_from(k.clone())?;
            state.api_keys.insert(key.id.clone(), key);
        }
        TxOperation::PutKnowledgeBase(kb) => {
            let kb = KnowledgeBase::try_from(kb.clone())?;
            state.knowledge_bases.insert(kb.id.clone(), kb);
        }
        TxOperation::PutDocument(d) => {
            let doc = kb_core::model::Document::try_from(d.clone())?;
            state.documents.insert(doc.id.clone(), doc);
        }
        TxOperation::PutChunk(c) => {
            let chunk = Chunk::try_from(c.clone())?;
            state.chunks.insert(chunk.id.clone(), chunk);
        }
        TxOperation::PutAdminToken(t) => {
            let token = AdminToken::from(t.clone());
            state.admin_tokens.insert(token.id.clone(), token);
        }
        TxOperation::DeleteTenant(id) => {
            state.tenants.remove(id);
        }
        TxOperation::DeleteApiKey(id) => {
            state.api_keys.remove(id);
        }
        TxOperation::DeleteKnowledgeBase(id) => {
            state.knowledge_bases.remove(id);
        }
        TxOperation::DeleteDocument(id) => {
            state.documents.remove(id);
        }
        TxOperation::DeleteChunk(id) => {
            state.chunks.remove(id);
        }
        TxOperation::DeleteAdminToken(id) => {
            state.admin_tokens.remove(id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::model::{Clearance as ClearanceEnum, Document, SummaryStatus};
    use tempfile::tempdir;

    fn test_tenant(id: &str) -> Tenant {
        Tenant {
            id: id.to_string(),
            status: TenantStatus::Active,
            quotas: TenantQuotas::unlimited(),
        }
    }

    fn test_kb(id: &str, tenant_id: &str) -> KnowledgeBase {
        use kb_core::model::{ChunkerConfig, EmbeddingConfig, KnowledgeBaseConfig, RetrieverConfig};
        KnowledgeBase {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            name: "docs".to_string(),
            config: KnowledgeBaseConfig {
                chunker: ChunkerConfig {
                    name: "simple".to_string(),
                    params: serde_json::json!({}),
                },
                retriever: RetrieverConfig {
                    name: "dense".to_string(),
                    params: serde_json::json!({}),
                },
                embedding: EmbeddingConfig {
                    provider: "deterministic".to_string(),
                    model: "test".to_string(),
                    dimensions: 8,
                },
            },
        }
    }

    fn test_doc(id: &str, kb_id: &str) -> Document {
        Document {
            id: id.to_string(),
            kb_id: kb_id.to_string(),
            title: "title".to_string(),
            content: "content".to_string(),
            sensitivity_level: SensitivityLevel::Internal,
            acl: AclLists::default(),
            summary: None,
            summary_status: SummaryStatus::NotRequested,
            metadata: HashMap::new(),
        }
    }

    fn test_chunk(id: &str, doc_id: &str, kb_id: &str, tenant_id: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            doc_id: doc_id.to_string(),
            kb_id: kb_id.to_string(),
            tenant_id: tenant_id.to_string(),
            ordinal: 0,
            text: "hello".to_string(),
            metadata: HashMap::new(),
            sensitivity_level: SensitivityLevel::Internal,
            acl: AclLists::default(),
            indexing_status: IndexingStatus::Pending,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_repo_put_get_chunk() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("test.wal")).await.unwrap();

        repo.put_tenant(test_tenant("acme")).await.unwrap();
        repo.put_knowledge_base(test_kb("kb1", "acme")).await.unwrap();
        repo.put_document(test_doc("d1", "kb1")).await.unwrap();
        repo.put_chunk(test_chunk("c1", "d1", "kb1", "acme")).await.unwrap();

        let chunk = repo.get_chunk("c1").await.unwrap();
        assert_eq!(chunk.text, "hello");
        assert_eq!(chunk.sensitivity_level, SensitivityLevel::Internal);
    }

    #[tokio::test]
    async fn test_repo_replay_on_restart() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("replay.wal");

        {
            let repo = Repository::open(&wal_path).await.unwrap();
            repo.put_tenant(test_tenant("acme")).await.unwrap();
            repo.put_knowledge_base(test_kb("kb1", "acme")).await.unwrap();
            repo.put_document(test_doc("d1", "kb1")).await.unwrap();
            repo.put_chunk(test_chunk("c1", "d1", "kb1", "acme")).await.unwrap();
        }

        {
            let repo = Repository::open(&wal_path).await.unwrap();
            assert_eq!(repo.get_chunk("c1").await.unwrap().doc_id, "d1");
            assert_eq!(repo.get_tenant("acme").await.unwrap().status, TenantStatus::Active);
        }
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_unknown_reference() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("rollback.wal")).await.unwrap();

        let result = repo
            .apply_index_transaction(vec![IndexMutation::PutKnowledgeBase(test_kb("kb1", "ghost-tenant"))])
            .await;

        assert!(result.is_err());
        assert!(repo.get_knowledge_base("kb1").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_document_cascades_to_chunks() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("cascade.wal")).await.unwrap();

        repo.put_tenant(test_tenant("acme")).await.unwrap();
        repo.put_knowledge_base(test_kb("kb1", "acme")).await.unwrap();
        repo.put_document(test_doc("d1", "kb1")).await.unwrap();
        repo.put_chunk(test_chunk("c1", "d1", "kb1", "acme")).await.unwrap();

        repo.delete_document("d1").await.unwrap();

        assert!(repo.get_document("d1").await.is_err());
        assert!(repo.get_chunk("c1").await.is_err());
    }

    #[tokio::test]
    async fn test_open_with_snapshots_restores_snapshot_and_wal_delta() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("snapshot_restore.wal");
        let snapshot_dir = dir.path().join("snapshots");

        {
            let repo = Repository::open_with_snapshots(&wal_path, &snapshot_dir).await.unwrap();
            repo.put_tenant(test_tenant("acme")).await.unwrap();
            repo.put_knowledge_base(test_kb("kb1", "acme")).await.unwrap();
            repo.put_document(test_doc("d1", "kb1")).await.unwrap();
            repo.create_backup_snapshot().await.unwrap();
            repo.put_chunk(test_chunk("c1", "d1", "kb1", "acme")).await.unwrap();
        }

        let reopened = Repository::open_with_snapshots(&wal_path, &snapshot_dir).await.unwrap();
        assert!(reopened.get_chunk("c1").await.is_ok());
        assert!(reopened.get_document("d1").await.is_ok());
    }

    #[tokio::test]
    async fn test_idempotency_round_trips_after_restart() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("idempotency.wal");

        {
            let repo = Repository::open(&wal_path).await.unwrap();
            repo.record_idempotency("hash-1", vec!["c1".to_string(), "c2".to_string()])
                .await
                .unwrap();
        }

        let repo = Repository::open(&wal_path).await.unwrap();
        let ids = repo.check_idempotency("hash-1").await.unwrap();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn clearance_round_trips_through_u8() {
        for clearance in [
            ClearanceEnum::Public,
            ClearanceEnum::Internal,
            ClearanceEnum::Confidential,
            ClearanceEnum::Secret,
        ] {
            assert_eq!(clearance_from_u8(clearance_to_u8(clearance)).unwrap(), clearance);
        }
    }
}
