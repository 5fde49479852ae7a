//! Organization and repository models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Organization entity. Owns roles and repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub organization_id: Uuid,
    pub name: String,
    pub created_utc: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            organization_id: Uuid::new_v4(),
            name: name.into(),
            created_utc: Utc::now(),
        }
    }
}

/// Repository entity - the protected resource. Has exactly one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub repository_id: Uuid,
    pub organization_id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub created_utc: DateTime<Utc>,
}

impl Repository {
    /// Resource type under which repositories are registered with the oracle.
    pub const RESOURCE_TYPE: &'static str = "repository";

    pub fn new(organization_id: Uuid, owner_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            repository_id: Uuid::new_v4(),
            organization_id,
            owner_id,
            name: name.into(),
            created_utc: Utc::now(),
        }
    }

    /// Instance key used for oracle bindings and checks.
    pub fn resource_instance(&self) -> String {
        self.repository_id.to_string()
    }

    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.owner_id == user_id
    }
}
