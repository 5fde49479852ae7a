//! In-process RBAC engine implementing the oracle capability set.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;
use uuid::Uuid;

use super::{
    AuthorizationOracle, OracleError, PermissionQuery, Principal, ResourceDefinition,
    RoleBinding, RoleDefinition,
};

/// In-memory oracle for development and tests.
///
/// Creation calls answer `AlreadyExists` on repeats, exactly like a remote
/// policy service would; [`super::OracleClient`] is what turns that into
/// success.
#[derive(Default)]
pub struct LocalOracle {
    principals: DashMap<Uuid, serde_json::Map<String, serde_json::Value>>,
    resources: DashMap<String, ResourceDefinition>,
    roles: DashMap<String, RoleDefinition>,
    bindings: DashSet<RoleBinding>,
    unavailable: AtomicBool,
    failures_remaining: AtomicU32,
    calls: DashMap<&'static str, u64>,
}

impl LocalOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a full outage: every call fails with a transport error.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with a transport error, then recover.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// How many times `operation` was invoked, failures included.
    pub fn call_count(&self, operation: &str) -> u64 {
        self.calls.get(operation).map(|c| *c).unwrap_or(0)
    }

    pub fn bindings_for(&self, user_id: Uuid) -> Vec<RoleBinding> {
        self.bindings
            .iter()
            .filter(|b| b.user_id == user_id)
            .map(|b| b.clone())
            .collect()
    }

    pub fn has_principal(&self, user_id: Uuid) -> bool {
        self.principals.contains_key(&user_id)
    }

    pub fn has_role(&self, key: &str) -> bool {
        self.roles.contains_key(key)
    }

    pub fn resource(&self, key: &str) -> Option<ResourceDefinition> {
        self.resources.get(key).map(|r| r.clone())
    }

    fn enter(&self, operation: &'static str) -> Result<(), OracleError> {
        *self.calls.entry(operation).or_insert(0) += 1;

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OracleError::Transport("oracle unavailable".to_string()));
        }
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(OracleError::Transport(format!(
                "injected failure during {}",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthorizationOracle for LocalOracle {
    async fn sync_principal(&self, principal: &Principal) -> Result<(), OracleError> {
        self.enter("sync_principal")?;
        self.principals
            .insert(principal.user_id, principal.attributes.clone());
        Ok(())
    }

    async fn provision_resource(&self, resource: &ResourceDefinition) -> Result<(), OracleError> {
        self.enter("provision_resource")?;
        if self.resources.contains_key(&resource.key) {
            return Err(OracleError::AlreadyExists(resource.key.clone()));
        }
        self.resources.insert(resource.key.clone(), resource.clone());
        Ok(())
    }

    async fn provision_role(&self, role: &RoleDefinition) -> Result<(), OracleError> {
        self.enter("provision_role")?;
        if self.roles.contains_key(&role.key) {
            return Err(OracleError::AlreadyExists(role.key.clone()));
        }
        self.roles.insert(role.key.clone(), role.clone());
        Ok(())
    }

    async fn bind_role(&self, binding: &RoleBinding) -> Result<(), OracleError> {
        self.enter("bind_role")?;
        if !self.roles.contains_key(&binding.role_key) {
            return Err(OracleError::NotFound(format!("role {}", binding.role_key)));
        }
        if !self.bindings.insert(binding.clone()) {
            return Err(OracleError::AlreadyExists(format!(
                "{} bound to {}",
                binding.role_key, binding.user_id
            )));
        }
        debug!(user_id = %binding.user_id, role = %binding.role_key, "Role bound");
        Ok(())
    }

    async fn unbind_role(&self, binding: &RoleBinding) -> Result<(), OracleError> {
        self.enter("unbind_role")?;
        match self.bindings.remove(binding) {
            Some(_) => Ok(()),
            None => Err(OracleError::NotFound(format!(
                "{} bound to {}",
                binding.role_key, binding.user_id
            ))),
        }
    }

    async fn check(&self, query: &PermissionQuery) -> Result<bool, OracleError> {
        self.enter("check")?;
        let permission = format!("{}:{}", query.resource_type, query.action);
        let allowed = self.bindings.iter().any(|binding| {
            binding.user_id == query.user_id
                && binding.resource_type == query.resource_type
                && (binding.resource_instance.is_none()
                    || binding.resource_instance == query.resource_instance)
                && self
                    .roles
                    .get(&binding.role_key)
                    .is_some_and(|role| role.permissions.contains(&permission))
        });
        Ok(allowed)
    }
}
