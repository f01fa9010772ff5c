use crate::model::TenantQuotas;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("tenant is required")]
    MissingTenant,
    #[error("kb_count quota exceeded for tenant {tenant}: limit {limit}")]
    KbCountExceeded { tenant: String, limit: i64 },
    #[error("doc_count quota exceeded for tenant {tenant}: limit {limit}")]
    DocCountExceeded { tenant: String, limit: i64 },
    #[error("storage_mb quota exceeded for tenant {tenant}: limit {limit}")]
    StorageExceeded { tenant: String, limit: i64 },
    #[error("quota store lock poisoned")]
    StorePoisoned,
}

pub trait QuotaStore: Send + Sync {
    fn upsert_quotas(&self, tenant_id: &str, quotas: TenantQuotas) -> Result<(), QuotaError>;
    fn get_quotas(&self, tenant_id: &str) -> Result<Option<TenantQuotas>, QuotaError>;
}

#[derive(Default)]
pub struct InMemoryQuotaStore {
    quotas: RwLock<HashMap<String, TenantQuotas>>,
}

impl QuotaStore for InMemoryQuotaStore {
    fn upsert_quotas(&self, tenant_id: &str, quotas: TenantQuotas) -> Result<(), QuotaError> {
        if tenant_id.trim().is_empty() {
            return Err(QuotaError::MissingTenant);
        }
        let mut map = self.quotas.write().map_err(|_| QuotaError::StorePoisoned)?;
        map.insert(tenant_id.to_string(), quotas);
        Ok(())
    }

    fn get_quotas(&self, tenant_id: &str) -> Result<Option<TenantQuotas>, QuotaError> {
        let map = self.quotas.read().map_err(|_| QuotaError::StorePoisoned)?;
        Ok(map.get(tenant_id).cloned())
    }
}

/// Checks a tenant's current usage against its configured quotas. Call
/// before any mutation that grows kb_count, doc_count, or storage_mb.
pub fn check_within_quota(
    tenant_id: &str,
    quotas: &TenantQuotas,
    kb_count: i64,
    doc_count: i64,
    storage_mb: i64,
) -> Result<(), QuotaError> {
    if !TenantQuotas::within(quotas.kb_count, kb_count) {
        return Err(QuotaError::KbCountExceeded {
            tenant: tenant_id.to_string(),
            limit: quotas.kb_count,
        });
    }
    if !TenantQuotas::within(quotas.doc_count, doc_count) {
        return Err(QuotaError::DocCountExceeded {
            tenant: tenant_id.to_string(),
            limit: quotas.doc_count,
        });
    }
    if !TenantQuotas::within(quotas.storage_mb, storage_mb) {
        return Err(QuotaError::StorageExceeded {
            tenant: tenant_id.to_string(),
            limit: quotas.storage_mb,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_quota_always_passes() {
        let quotas = TenantQuotas::unlimited();
        assert!(check_within_quota("acme", &quotas, 1_000_000, 1_000_000, 1_000_000).is_ok());
    }

    #[test]
    fn rejects_kb_count_over_limit() {
        let quotas = TenantQuotas {
            kb_count: 2,
            doc_count: TenantQuotas::UNLIMITED,
            storage_mb: TenantQuotas::UNLIMITED,
        };
        let err = check_within_quota("acme", &quotas, 2, 0, 0).unwrap_err();
        assert!(matches!(err, QuotaError::KbCountExceeded { .. }));
    }

    #[test]
    fn store_round_trips_quotas() {
        let store = InMemoryQuotaStore::default();
        let quotas = TenantQuotas {
            kb_count: 5,
            doc_count: 100,
            storage_mb: 1024,
        };
        store.upsert_quotas("acme", quotas.clone()).unwrap();
        let loaded = store.get_quotas("acme").unwrap().unwrap();
        assert_eq!(loaded, quotas);
    }
}
