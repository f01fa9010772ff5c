use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Disabled,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantQuotas {
    pub kb_count: i64,
    pub doc_count: i64,
    pub storage_mb: i64,
}

impl TenantQuotas {
    pub const UNLIMITED: i64 = -1;

    pub fn unlimited() -> Self {
        Self {
            kb_count: Self::UNLIMITED,
            doc_count: Self::UNLIMITED,
            storage_mb: Self::UNLIMITED,
        }
    }

    pub fn within(limit: i64, used: i64) -> bool {
        limit == Self::UNLIMITED || used < limit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: String,
    pub status: TenantStatus,
    pub quotas: TenantQuotas,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        matches!(self.status, TenantStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyRole {
    Admin,
    Write,
    Read,
}

/// Clearance ordering is significant: `public < internal < confidential < secret`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clearance {
    Public,
    Internal,
    Confidential,
    Secret,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Identity {
    pub user: String,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
}

impl Identity {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            roles: Vec::new(),
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKey {
    pub id: String,
    pub tenant_id: String,
    /// One-way digest of the plaintext key; the plaintext is never stored.
    pub hashed_key: String,
    pub prefix: String,
    pub role: ApiKeyRole,
    pub scope_kb_ids: Option<Vec<String>>,
    pub identity: Identity,
    pub clearance: Clearance,
    pub rate_limit_per_minute: Option<u32>,
    pub revoked: bool,
    pub expires_at: Option<u64>,
}

impl ApiKey {
    pub fn is_expired(&self, now_unix: u64) -> bool {
        self.expires_at.map(|exp| now_unix >= exp).unwrap_or(false)
    }

    pub fn is_usable(&self, now_unix: u64) -> bool {
        !self.revoked && !self.is_expired(now_unix)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkerConfig {
    pub name: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrieverConfig {
    pub name: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeBaseConfig {
    pub chunker: ChunkerConfig,
    pub retriever: RetrieverConfig,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeBase {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub config: KnowledgeBaseConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityLevel {
    Public,
    Internal,
    Confidential,
    Secret,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AclLists {
    pub allow_users: Vec<String>,
    pub allow_roles: Vec<String>,
    pub allow_groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    NotRequested,
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub kb_id: String,
    pub title: String,
    pub content: String,
    pub sensitivity_level: SensitivityLevel,
    pub acl: AclLists,
    pub summary: Option<String>,
    pub summary_status: SummaryStatus,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStatus {
    Pending,
    Indexed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub kb_id: String,
    pub tenant_id: String,
    pub ordinal: usize,
    pub text: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub sensitivity_level: SensitivityLevel,
    pub acl: AclLists,
    pub indexing_status: IndexingStatus,
    pub last_error: Option<String>,
}

impl Chunk {
    pub fn parent_id(&self) -> Option<&str> {
        self.metadata.get("parent_id").and_then(|v| v.as_str())
    }

    pub fn is_child(&self) -> bool {
        self.metadata
            .get("child")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminToken {
    pub id: String,
    pub hashed_token: String,
    pub prefix: String,
    pub revoked: bool,
    pub expires_at: Option<u64>,
}
