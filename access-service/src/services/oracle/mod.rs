//! Authorization oracle boundary.
//!
//! The oracle stores role bindings and evaluates permission checks. Any
//! implementation of [`AuthorizationOracle`] can be plugged in: the
//! in-process [`LocalOracle`] or the HTTP-backed [`RemoteOracle`]. Callers go
//! through [`OracleClient`], which adds idempotency, retries and fail-closed
//! checks on top of the raw capability set.

mod client;
mod local;
mod remote;

pub use client::{OracleClient, RetryPolicy};
pub use local::LocalOracle;
pub use remote::{RemoteOracle, RemoteOracleConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A user as known to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Resource type with its full action vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub key: String,
    pub name: String,
    pub actions: Vec<String>,
}

/// Role with `resource:action` permission keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub key: String,
    pub name: String,
    pub permissions: Vec<String>,
}

/// Grant of a role to a user, optionally scoped to one resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleBinding {
    pub user_id: Uuid,
    pub role_key: String,
    pub resource_type: String,
    pub resource_instance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionQuery {
    pub user_id: Uuid,
    pub action: String,
    pub resource_type: String,
    pub resource_instance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected by oracle: {0}")]
    Rejected(String),

    #[error("oracle transport failure: {0}")]
    Transport(String),

    #[error("invalid oracle response: {0}")]
    InvalidResponse(String),
}

impl OracleError {
    /// Only transport-class failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, OracleError::Transport(_))
    }
}

/// Raw oracle capability set.
#[async_trait]
pub trait AuthorizationOracle: Send + Sync {
    async fn sync_principal(&self, principal: &Principal) -> Result<(), OracleError>;

    async fn provision_resource(&self, resource: &ResourceDefinition) -> Result<(), OracleError>;

    async fn provision_role(&self, role: &RoleDefinition) -> Result<(), OracleError>;

    async fn bind_role(&self, binding: &RoleBinding) -> Result<(), OracleError>;

    async fn unbind_role(&self, binding: &RoleBinding) -> Result<(), OracleError>;

    async fn check(&self, query: &PermissionQuery) -> Result<bool, OracleError>;
}
