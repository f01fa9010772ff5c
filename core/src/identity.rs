use crate::error::{ErrorCode, RetrievalError};
use crate::model::{ApiKey, ApiKeyRole, Clearance, Tenant};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Per-request identity and scope, produced by [`resolve`](IdentityResolver::resolve).
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub tenant_id: String,
    pub api_key_id: String,
    pub role: ApiKeyRole,
    /// Empty means unrestricted (the key may address any KB in its tenant).
    pub scope_kb_ids: Vec<String>,
    pub identity: RequestIdentity,
}

impl RequestContext {
    pub fn is_admin(&self) -> bool {
        matches!(self.role, ApiKeyRole::Admin)
    }

    pub fn in_scope(&self, kb_id: &str) -> bool {
        self.scope_kb_ids.is_empty() || self.scope_kb_ids.iter().any(|s| s == kb_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestIdentity {
    pub user: String,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
    pub clearance: Clearance,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("unknown or invalid api key")]
    Unknown,
    #[error("api key is revoked")]
    Revoked,
    #[error("api key has expired")]
    Expired,
    #[error("tenant is not active")]
    TenantDisabled,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

impl RetrievalError for IdentityError {
    fn error_code(&self) -> ErrorCode {
        match self {
            IdentityError::MissingToken
            | IdentityError::Unknown
            | IdentityError::Revoked
            | IdentityError::Expired => ErrorCode::AuthInvalid,
            IdentityError::TenantDisabled => ErrorCode::TenantDisabled,
            IdentityError::RateLimited { .. } => ErrorCode::RateLimited,
        }
    }
}

/// Computes the collision-resistant one-way digest an api-key is looked up by.
pub fn hash_credential(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn strip_bearer(token: &str) -> &str {
    token
        .trim()
        .strip_prefix("Bearer ")
        .or_else(|| token.trim().strip_prefix("bearer "))
        .unwrap_or(token)
        .trim()
}

/// Looks up an api key by its one-way digest. Implemented by the durable
/// repository; kept as a trait so identity resolution never depends on a
/// concrete storage backend.
pub trait ApiKeyLookup: Send + Sync {
    fn find_by_hash(&self, hashed_key: &str) -> Option<ApiKey>;
    fn find_tenant(&self, tenant_id: &str) -> Option<Tenant>;
}

/// Sliding-window rate limiter, keyed by api-key-id. Window = 60s by default;
/// capacity is the api-key's override or the caller-supplied default.
pub trait RateLimiter: Send + Sync {
    /// Returns `Ok(())` if a token was acquired, or the retry-after interval
    /// in seconds if the window is full.
    fn acquire(&self, key: &str, capacity: u32) -> Result<(), u64>;
}

pub struct IdentityResolver<L, R> {
    lookup: L,
    limiter: R,
    default_rate_limit: u32,
}

impl<L, R> IdentityResolver<L, R>
where
    L: ApiKeyLookup,
    R: RateLimiter,
{
    pub fn new(lookup: L, limiter: R, default_rate_limit: u32) -> Self {
        Self {
            lookup,
            limiter,
            default_rate_limit,
        }
    }

    pub fn resolve(&self, credential: &str, now_unix: u64) -> Result<RequestContext, IdentityError> {
        let normalized = strip_bearer(credential);
        if normalized.is_empty() {
            return Err(IdentityError::MissingToken);
        }

        let digest = hash_credential(normalized);
        let api_key = self
            .lookup
            .find_by_hash(&digest)
            .ok_or(IdentityError::Unknown)?;

        if api_key.revoked {
            return Err(IdentityError::Revoked);
        }
        if api_key.is_expired(now_unix) {
            return Err(IdentityError::Expired);
        }

        let tenant = self
            .lookup
            .find_tenant(&api_key.tenant_id)
            .ok_or(IdentityError::Unknown)?;
        if !tenant.is_active() {
            return Err(IdentityError::TenantDisabled);
        }

        let capacity = api_key.rate_limit_per_minute.unwrap_or(self.default_rate_limit);
        if let Err(retry_after_secs) = self.limiter.acquire(&api_key.id, capacity) {
            return Err(IdentityError::RateLimited { retry_after_secs });
        }

        Ok(RequestContext {
            tenant_id: api_key.tenant_id,
            api_key_id: api_key.id,
            role: api_key.role,
            scope_kb_ids: api_key.scope_kb_ids.unwrap_or_default(),
            identity: RequestIdentity {
                user: api_key.identity.user,
                roles: api_key.identity.roles,
                groups: api_key.identity.groups,
                clearance: api_key.clearance,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AclLists, Identity, TenantQuotas, TenantStatus};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedLookup {
        keys: HashMap<String, ApiKey>,
        tenants: HashMap<String, Tenant>,
    }

    impl ApiKeyLookup for FixedLookup {
        fn find_by_hash(&self, hashed_key: &str) -> Option<ApiKey> {
            self.keys.get(hashed_key).cloned()
        }
        fn find_tenant(&self, tenant_id: &str) -> Option<Tenant> {
            self.tenants.get(tenant_id).cloned()
        }
    }

    struct AlwaysAllow(Mutex<HashMap<String, u32>>);

    impl RateLimiter for AlwaysAllow {
        fn acquire(&self, key: &str, capacity: u32) -> Result<(), u64> {
            let mut counts = self.0.lock().unwrap();
            let count = counts.entry(key.to_string()).or_insert(0);
            *count += 1;
            if *count > capacity {
                Err(60)
            } else {
                Ok(())
            }
        }
    }

    fn sample_key(tenant_id: &str, plaintext: &str) -> ApiKey {
        ApiKey {
            id: "key-1".to_string(),
            tenant_id: tenant_id.to_string(),
            hashed_key: hash_credential(plaintext),
            prefix: plaintext[..4.min(plaintext.len())].to_string(),
            role: ApiKeyRole::Read,
            scope_kb_ids: None,
            identity: Identity::new("alice"),
            clearance: Clearance::Internal,
            rate_limit_per_minute: Some(2),
            revoked: false,
            expires_at: None,
        }
    }

    fn resolver_with(key: ApiKey, tenant: Tenant) -> IdentityResolver<FixedLookup, AlwaysAllow> {
        let mut keys = HashMap::new();
        keys.insert(key.hashed_key.clone(), key);
        let mut tenants = HashMap::new();
        tenants.insert(tenant.id.clone(), tenant);
        IdentityResolver::new(
            FixedLookup { keys, tenants },
            AlwaysAllow(Mutex::new(HashMap::new())),
            120,
        )
    }

    #[test]
    fn resolves_valid_bearer_token() {
        let key = sample_key("acme", "sk-test-123");
        let tenant = Tenant {
            id: "acme".into(),
            status: TenantStatus::Active,
            quotas: TenantQuotas::unlimited(),
        };
        let resolver = resolver_with(key, tenant);

        let ctx = resolver.resolve("Bearer sk-test-123", 0).unwrap();
        assert_eq!(ctx.tenant_id, "acme");
        assert!(ctx.in_scope("any-kb"));
    }

    #[test]
    fn rejects_unknown_token() {
        let key = sample_key("acme", "sk-test-123");
        let tenant = Tenant {
            id: "acme".into(),
            status: TenantStatus::Active,
            quotas: TenantQuotas::unlimited(),
        };
        let resolver = resolver_with(key, tenant);

        let err = resolver.resolve("Bearer wrong-token", 0).unwrap_err();
        assert_eq!(err, IdentityError::Unknown);
    }

    #[test]
    fn rejects_disabled_tenant() {
        let key = sample_key("acme", "sk-test-123");
        let tenant = Tenant {
            id: "acme".into(),
            status: TenantStatus::Disabled,
            quotas: TenantQuotas::unlimited(),
        };
        let resolver = resolver_with(key, tenant);

        let err = resolver.resolve("Bearer sk-test-123", 0).unwrap_err();
        assert_eq!(err, IdentityError::TenantDisabled);
    }

    #[test]
    fn enforces_per_key_rate_limit() {
        let key = sample_key("acme", "sk-test-123");
        let tenant = Tenant {
            id: "acme".into(),
            status: TenantStatus::Active,
            quotas: TenantQuotas::unlimited(),
        };
        let resolver = resolver_with(key, tenant);

        assert!(resolver.resolve("Bearer sk-test-123", 0).is_ok());
        assert!(resolver.resolve("Bearer sk-test-123", 0).is_ok());
        let err = resolver.resolve("Bearer sk-test-123", 0).unwrap_err();
        assert!(matches!(err, IdentityError::RateLimited { .. }));
    }

    #[test]
    fn acl_empty_lists_mean_unrestricted() {
        let acl = AclLists::default();
        assert!(acl.allow_users.is_empty());
    }
}
