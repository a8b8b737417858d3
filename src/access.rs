use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl Role {
    /// Whether the role may move money on behalf of the scope it was granted
    /// in. Kept as an exhaustive match so a new role forces a decision here.
    pub fn can_administer(self) -> bool {
        match self {
            Role::Owner | Role::Admin => true,
            Role::Member | Role::Viewer => false,
        }
    }
}

/// Role lookups are answered by the embedding platform; this crate only asks.
/// `scope_ref` is an organization id or a task reference, whatever universe
/// the embedder keys its grants by.
pub trait AccessPolicy: Send + Sync {
    /// None means the actor has no standing in the scope at all.
    fn role_of(&self, scope_ref: &str, actor_id: &str) -> Option<Role>;
}

/// Fixed grant table, used by the tests and the replay binary. Grants can be
/// added behind a shared reference so a running service can be wired up.
#[derive(Debug, Default)]
pub struct StaticAccessPolicy {
    grants: RwLock<HashMap<String, HashMap<String, Role>>>,
}

impl StaticAccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, scope_ref: impl Into<String>, actor_id: impl Into<String>, role: Role) {
        let mut grants = self.grants.write().unwrap_or_else(PoisonError::into_inner);
        grants
            .entry(scope_ref.into())
            .or_default()
            .insert(actor_id.into(), role);
    }
}

impl AccessPolicy for StaticAccessPolicy {
    fn role_of(&self, scope_ref: &str, actor_id: &str) -> Option<Role> {
        let grants = self.grants.read().ok()?;
        grants.get(scope_ref)?.get(actor_id).copied()
    }
}
