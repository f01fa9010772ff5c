//! Dense Store Adapter: vector similarity search over chunk embeddings,
//! scoped by tenant/kb and filtered by the caller's ACL predicate.
//!
//! Generalizes the linear-scan cosine-similarity index in `index::ann` from
//! `u64` node ids to string chunk ids, and adds the tenant/kb/filter
//! push-down the retrieval spec requires at the store boundary rather than
//! as a post-filter: every entry carries the same ACL metadata the chunk
//! record does, and `search` evaluates `kb_core::acl::Filter` against it
//! directly instead of delegating to the caller.

use std::collections::HashMap;
use std::sync::RwLock;

use kb_core::acl::{AclMeta, Filter};

#[derive(Debug, Clone)]
struct Entry {
    tenant_id: String,
    kb_id: String,
    doc_id: String,
    embedding: Vec<f32>,
    acl: AclMeta,
}

/// In-process dense vector store. One instance is shared across tenants;
/// every lookup is scoped to a (tenant_id, kb_id) pair so a query can never
/// see another tenant's vectors even on a implementation bug in the caller.
#[derive(Default)]
pub struct DenseStore {
    entries: RwLock<HashMap<String, Entry>>,
}

pub struct DenseHit {
    pub chunk_id: String,
    pub score: f32,
}

impl DenseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(
        &self,
        chunk_id: String,
        tenant_id: String,
        kb_id: String,
        doc_id: String,
        embedding: Vec<f32>,
        acl: AclMeta,
    ) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            chunk_id,
            Entry {
                tenant_id,
                kb_id,
                doc_id,
                embedding,
                acl,
            },
        );
    }

    pub fn delete(&self, chunk_id: &str) -> bool {
        self.entries.write().unwrap().remove(chunk_id).is_some()
    }

    pub fn delete_by_doc(&self, tenant_id: &str, kb_id: &str, chunk_ids: &[String]) {
        let mut entries = self.entries.write().unwrap();
        for id in chunk_ids {
            if let Some(entry) = entries.get(id) {
                if entry.tenant_id == tenant_id && entry.kb_id == kb_id {
                    entries.remove(id);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-k cosine-similarity search scoped to one tenant/kb, with the
    /// caller's ACL filter evaluated against each entry's stored metadata
    /// before scoring, so ACL push-down happens at the store boundary
    /// rather than as a post-hoc trim over hydrated candidates.
    pub fn search(&self, tenant_id: &str, kb_id: &str, query: &[f32], k: usize, filter: &Filter) -> Vec<DenseHit> {
        let entries = self.entries.read().unwrap();
        let mut scored: Vec<DenseHit> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.tenant_id == tenant_id && entry.kb_id == kb_id && filter.matches(&entry.acl)
            })
            .filter_map(|(id, entry)| {
                cosine_similarity(query, &entry.embedding).map(|score| DenseHit {
                    chunk_id: id.clone(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    pub fn embedding_dimension(&self, tenant_id: &str, kb_id: &str) -> Option<usize> {
        let entries = self.entries.read().unwrap();
        entries
            .values()
            .find(|entry| entry.tenant_id == tenant_id && entry.kb_id == kb_id)
            .map(|entry| entry.embedding.len())
    }

}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some(dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::model::SensitivityLevel;

    fn unrestricted() -> AclMeta {
        AclMeta {
            sensitivity_level: SensitivityLevel::Public,
            acl_allow_users: vec![],
            acl_allow_roles: vec![],
            acl_allow_groups: vec![],
        }
    }

    #[test]
    fn search_is_scoped_to_tenant_and_kb() {
        let store = DenseStore::new();
        store.upsert("c1".into(), "acme".into(), "kb1".into(), "d1".into(), vec![1.0, 0.0], unrestricted());
        store.upsert("c2".into(), "other".into(), "kb1".into(), "d1".into(), vec![1.0, 0.0], unrestricted());

        let hits = store.search("acme", "kb1", &[1.0, 0.0], 10, &Filter::allow_all());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");
    }

    #[test]
    fn search_respects_acl_filter_pushed_down_to_the_store() {
        let store = DenseStore::new();
        let restricted = AclMeta {
            sensitivity_level: SensitivityLevel::Public,
            acl_allow_users: vec!["bob".to_string()],
            acl_allow_roles: vec![],
            acl_allow_groups: vec![],
        };
        store.upsert("c1".into(), "acme".into(), "kb1".into(), "d1".into(), vec![1.0, 0.0], restricted);
        store.upsert("c2".into(), "acme".into(), "kb1".into(), "d1".into(), vec![0.9, 0.1], unrestricted());

        let filter = Filter {
            max_sensitivity: SensitivityLevel::Secret,
            allow_users: Some(vec!["alice".to_string()]),
            allow_roles: Some(vec![]),
            allow_groups: Some(vec![]),
        };
        let hits = store.search("acme", "kb1", &[1.0, 0.0], 10, &filter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c2");
    }

    #[test]
    fn search_respects_sensitivity_ceiling() {
        let store = DenseStore::new();
        let secret = AclMeta {
            sensitivity_level: SensitivityLevel::Secret,
            acl_allow_users: vec![],
            acl_allow_roles: vec![],
            acl_allow_groups: vec![],
        };
        store.upsert("c1".into(), "acme".into(), "kb1".into(), "d1".into(), vec![1.0, 0.0], secret);

        let filter = Filter {
            max_sensitivity: SensitivityLevel::Internal,
            allow_users: None,
            allow_roles: None,
            allow_groups: None,
        };
        let hits = store.search("acme", "kb1", &[1.0, 0.0], 10, &filter);
        assert!(hits.is_empty());
    }

    #[test]
    fn delete_removes_vector() {
        let store = DenseStore::new();
        store.upsert("c1".into(), "acme".into(), "kb1".into(), "d1".into(), vec![1.0], unrestricted());
        assert!(store.delete("c1"));
        assert!(store.is_empty());
    }
}
