//! Role model - organization-scoped named sets of repository actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Repository;

/// Role entity (organization-scoped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub role_id: Uuid,
    pub organization_id: Uuid,
    /// Stable identifier used as the role key at the authorization oracle.
    pub role_key: String,
    pub role_label: String,
    /// Permitted actions, ordered and free of duplicates.
    pub actions: Vec<String>,
    pub created_utc: DateTime<Utc>,
}

impl Role {
    /// Create a new role. Actions are trimmed and de-duplicated, keeping the
    /// first occurrence.
    pub fn new(
        organization_id: Uuid,
        role_key: impl Into<String>,
        role_label: impl Into<String>,
        actions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            organization_id,
            role_key: role_key.into(),
            role_label: role_label.into(),
            actions: ordered_action_set(actions.into_iter().map(Into::into)),
            created_utc: Utc::now(),
        }
    }

    /// Permission keys in `resource_type:action` form.
    pub fn permission_keys(&self) -> Vec<String> {
        self.actions
            .iter()
            .map(|action| format!("{}:{}", Repository::RESOURCE_TYPE, action))
            .collect()
    }

    pub fn permits(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

/// Normalize a list of action strings into an ordered set.
pub fn ordered_action_set(actions: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut set: Vec<String> = Vec::new();
    for action in actions {
        let action = action.trim();
        if action.is_empty() || set.iter().any(|a| a == action) {
            continue;
        }
        set.push(action.to_string());
    }
    set
}
