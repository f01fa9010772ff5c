use crate::identity::RequestIdentity;
use crate::model::{AclLists, Document, SensitivityLevel};
use std::collections::HashSet;

/// ACL metadata a chunk inherits from its owning document.
#[derive(Debug, Clone, PartialEq)]
pub struct AclMeta {
    pub sensitivity_level: SensitivityLevel,
    pub acl_allow_users: Vec<String>,
    pub acl_allow_roles: Vec<String>,
    pub acl_allow_groups: Vec<String>,
}

/// Emits the ACL metadata a chunk should carry, inherited from its document.
pub fn metadata_for_chunk(doc: &Document) -> AclMeta {
    AclMeta {
        sensitivity_level: doc.sensitivity_level,
        acl_allow_users: doc.acl.allow_users.clone(),
        acl_allow_roles: doc.acl.allow_roles.clone(),
        acl_allow_groups: doc.acl.allow_groups.clone(),
    }
}

/// A store-side predicate equivalent to the boolean expression in §4.5.
/// Expressed as data (not a closure) so dense/sparse store adapters can
/// translate it into their own filter syntax.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub max_sensitivity: SensitivityLevel,
    pub allow_users: Option<Vec<String>>,
    pub allow_roles: Option<Vec<String>>,
    pub allow_groups: Option<Vec<String>>,
}

/// Builds the store-side filter for an identity's clearance and membership.
pub fn store_filter(identity: &RequestIdentity) -> Filter {
    Filter {
        max_sensitivity: identity.clearance_as_sensitivity(),
        allow_users: Some(vec![identity.user.clone()]),
        allow_roles: Some(identity.roles.clone()),
        allow_groups: Some(identity.groups.clone()),
    }
}

impl Filter {
    /// The permissive filter used for admin identities and system-internal
    /// calls that have no identity to scope against (store adapters still
    /// require a `Filter`; this is the "match everything" value).
    pub fn allow_all() -> Self {
        Filter {
            max_sensitivity: SensitivityLevel::Secret,
            allow_users: None,
            allow_roles: None,
            allow_groups: None,
        }
    }

    /// Evaluates this filter against one chunk's ACL metadata. A `None` list
    /// means "this dimension wasn't constrained" (skip it); a `Some` list is
    /// intersected against `meta`'s allow-list under the same
    /// empty-list-means-unrestricted semantics `matches` uses.
    pub fn matches(&self, meta: &AclMeta) -> bool {
        if meta.sensitivity_level > self.max_sensitivity {
            return false;
        }

        if let Some(allow_users) = &self.allow_users {
            if !meta.acl_allow_users.is_empty() {
                let filter_users: HashSet<&str> = allow_users.iter().map(String::as_str).collect();
                if !meta.acl_allow_users.iter().any(|u| filter_users.contains(u.as_str())) {
                    return false;
                }
            }
        }

        if let Some(allow_roles) = &self.allow_roles {
            if !meta.acl_allow_roles.is_empty() {
                let filter_roles: HashSet<&str> = allow_roles.iter().map(String::as_str).collect();
                if !meta.acl_allow_roles.iter().any(|r| filter_roles.contains(r.as_str())) {
                    return false;
                }
            }
        }

        if let Some(allow_groups) = &self.allow_groups {
            if !meta.acl_allow_groups.is_empty() {
                let filter_groups: HashSet<&str> = allow_groups.iter().map(String::as_str).collect();
                if !meta.acl_allow_groups.iter().any(|g| filter_groups.contains(g.as_str())) {
                    return false;
                }
            }
        }

        true
    }
}

impl RequestIdentity {
    fn clearance_as_sensitivity(&self) -> SensitivityLevel {
        match self.clearance {
            crate::model::Clearance::Public => SensitivityLevel::Public,
            crate::model::Clearance::Internal => SensitivityLevel::Internal,
            crate::model::Clearance::Confidential => SensitivityLevel::Confidential,
            crate::model::Clearance::Secret => SensitivityLevel::Secret,
        }
    }
}

/// Evaluates the ACL predicate against one chunk's metadata for one identity.
/// This is the single source of truth; it delegates to `Filter::matches` so
/// `store_filter`'s push-down predicate and `trim`'s re-check can never drift
/// apart into two separately maintained implementations.
pub fn matches(meta: &AclMeta, identity: &RequestIdentity) -> bool {
    store_filter(identity).matches(meta)
}

/// ACL metadata a chunk carries, derived from the `Chunk` record itself
/// (as opposed to `metadata_for_chunk`, which derives it from the owning
/// `Document` at chunk-creation time). Used by store adapters and retrievers
/// that only have the persisted chunk, not its document, in hand.
pub fn chunk_acl_meta(chunk: &crate::model::Chunk) -> AclMeta {
    AclMeta {
        sensitivity_level: chunk.sensitivity_level,
        acl_allow_users: chunk.acl.allow_users.clone(),
        acl_allow_roles: chunk.acl.allow_roles.clone(),
        acl_allow_groups: chunk.acl.allow_groups.clone(),
    }
}

/// Anything a `trim` call needs to re-evaluate the predicate: an ACL-bearing
/// metadata view plus whatever identifies it to the caller.
pub trait AclCarrier {
    fn acl_meta(&self) -> AclMeta;
}

/// Re-evaluates `matches` on every item; defense-in-depth for back-ends
/// without full filter fidelity. Admin identities bypass trimming entirely.
pub fn trim<T: AclCarrier>(hits: Vec<T>, identity: &RequestIdentity, is_admin: bool) -> Vec<T> {
    if is_admin {
        return hits;
    }
    hits.into_iter()
        .filter(|hit| matches(&hit.acl_meta(), identity))
        .collect()
}
