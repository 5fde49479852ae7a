//! Role assignment manager.
//!
//! Grants are committed locally first, then pushed to the authorization
//! oracle. A failed push leaves the grant in place with `oracle_synced =
//! false`; [`RoleAssignmentManager::resync_pending`] retries those later.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::audit::AuditRecorder;
use super::metrics::{ACCESS_REQUESTS_TOTAL, ERRORS_TOTAL};
use super::notification::{Notification, NotificationDispatcher};
use super::oracle::{OracleClient, PermissionQuery, Principal, ResourceDefinition, RoleBinding, RoleDefinition};
use super::outcome::SideEffect;
use super::store::AccessStore;
use super::ServiceError;
use crate::models::{
    ordered_action_set, AccessRequest, AuditAction, AuditRecord, ClientContext, EntityType,
    Repository, Role, RoleAssignment,
};

/// Result of finalizing an approved request.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeOutcome {
    pub request: AccessRequest,
    /// Present only when the request carried a role.
    pub assignment: Option<RoleAssignment>,
    pub oracle_sync: SideEffect,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevokeOutcome {
    pub assignment: RoleAssignment,
    pub oracle_sync: SideEffect,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub synced: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogReport {
    pub actions: usize,
    pub roles: usize,
    pub principals: usize,
}

#[derive(Clone)]
pub struct RoleAssignmentManager {
    store: Arc<dyn AccessStore>,
    oracle: OracleClient,
    audit: AuditRecorder,
    notifications: NotificationDispatcher,
}

impl RoleAssignmentManager {
    pub fn new(
        store: Arc<dyn AccessStore>,
        oracle: OracleClient,
        audit: AuditRecorder,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            oracle,
            audit,
            notifications,
        }
    }

    /// Approve `request` in one step and issue its grant.
    ///
    /// The status change and the assignment commit together; the oracle push
    /// that follows is best-effort and reported in the outcome.
    #[instrument(skip(self, request, repository, context), fields(request_id = %request.request_id, approver_id = %approver_id))]
    pub async fn finalize(
        &self,
        request: &AccessRequest,
        repository: &Repository,
        approver_id: Uuid,
        context: &ClientContext,
    ) -> Result<FinalizeOutcome, ServiceError> {
        let assignment = Self::grant_for(request);
        let approved = self
            .store
            .finalize_approval(request.request_id, approver_id, Utc::now(), assignment.as_ref())
            .await?;
        Ok(self
            .complete_approval(approved, assignment, repository, approver_id, context)
            .await)
    }

    /// The grant an approval of `request` issues. Action-list requests get none.
    pub fn grant_for(request: &AccessRequest) -> Option<RoleAssignment> {
        request.role_id.map(|role_id| {
            RoleAssignment::for_request(
                request.request_id,
                request.requester_id,
                role_id,
                request.repository_id,
                request.expires_utc,
            )
        })
    }

    /// Post-commit half of an approval: oracle push, audit and notification
    /// for a request the store has already moved to APPROVED together with
    /// `assignment`. Never fails; a failed push is reported in the outcome.
    #[instrument(skip_all, fields(request_id = %approved.request_id, approver_id = %approver_id))]
    pub async fn complete_approval(
        &self,
        approved: AccessRequest,
        mut assignment: Option<RoleAssignment>,
        repository: &Repository,
        approver_id: Uuid,
        context: &ClientContext,
    ) -> FinalizeOutcome {
        ACCESS_REQUESTS_TOTAL.with_label_values(&["approved"]).inc();
        info!(assignment = assignment.is_some(), "Access request approved");

        let oracle_sync = match assignment.as_mut() {
            Some(grant) => match self.push_binding(grant).await {
                Ok(()) => {
                    grant.oracle_synced = true;
                    SideEffect::Succeeded
                }
                Err(e) => {
                    ERRORS_TOTAL.with_label_values(&["oracle_sync"]).inc();
                    warn!(assignment_id = %grant.assignment_id, error = %e, "Oracle sync failed; grant kept locally");
                    SideEffect::failed(e)
                }
            },
            None => SideEffect::Skipped,
        };

        self.audit
            .append(
                AuditRecord::new(
                    AuditAction::Approved,
                    EntityType::AccessRequest,
                    approved.request_id,
                    format!("Access to repository {} approved", repository.name),
                )
                .actor(approver_id)
                .metadata(json!({
                    "approval_count": approved.approval_count,
                    "assignment_id": assignment.as_ref().map(|a| a.assignment_id),
                    "role_id": approved.role_id,
                    "requested_actions": approved.requested_actions,
                    "oracle_sync": oracle_sync,
                }))
                .context(context),
            )
            .await;

        if let (Some(grant), SideEffect::Failed { reason }) = (&assignment, &oracle_sync) {
            self.audit
                .append(
                    AuditRecord::new(
                        AuditAction::OracleSyncFailed,
                        EntityType::RoleAssignment,
                        grant.assignment_id,
                        "Role binding could not be pushed to the authorization oracle",
                    )
                    .actor(approver_id)
                    .metadata(json!({ "request_id": approved.request_id, "reason": reason }))
                    .context(context),
                )
                .await;
        }

        self.notifications
            .dispatch(vec![Notification::new(
                approved.requester_id,
                "Access approved",
                format!("Your access request for {} was approved", repository.name),
                json!({
                    "request_id": approved.request_id,
                    "assignment_id": assignment.as_ref().map(|a| a.assignment_id),
                }),
            )])
            .await;

        FinalizeOutcome {
            request: approved,
            assignment,
            oracle_sync,
        }
    }

    /// Delete a grant and unbind it at the oracle.
    ///
    /// Allowed for the repository owner and for the grantee.
    #[instrument(skip(self, context), fields(assignment_id = %assignment_id, actor_id = %actor_id))]
    pub async fn revoke(
        &self,
        assignment_id: Uuid,
        actor_id: Uuid,
        context: &ClientContext,
    ) -> Result<RevokeOutcome, ServiceError> {
        let assignment = self
            .store
            .find_role_assignment(assignment_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Role assignment", assignment_id))?;
        let repository = self.repository(assignment.repository_id).await?;
        if !repository.is_owned_by(actor_id) && assignment.user_id != actor_id {
            return Err(ServiceError::Authorization(
                "Only the repository owner or the grantee may revoke this role".to_string(),
            ));
        }

        let assignment = self
            .store
            .delete_role_assignment(assignment_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Role assignment", assignment_id))?;
        let oracle_sync = self.pull_binding(&assignment).await;

        self.audit
            .append(
                AuditRecord::new(
                    AuditAction::RoleRevoked,
                    EntityType::RoleAssignment,
                    assignment.assignment_id,
                    format!("Role revoked on repository {}", repository.name),
                )
                .actor(actor_id)
                .metadata(json!({
                    "user_id": assignment.user_id,
                    "role_id": assignment.role_id,
                    "repository_id": assignment.repository_id,
                    "oracle_sync": oracle_sync,
                }))
                .context(context),
            )
            .await;

        if assignment.user_id != actor_id {
            self.notifications
                .dispatch(vec![Notification::new(
                    assignment.user_id,
                    "Access revoked",
                    format!("Your access to {} was revoked", repository.name),
                    json!({ "assignment_id": assignment.assignment_id }),
                )])
                .await;
        }

        Ok(RevokeOutcome {
            assignment,
            oracle_sync,
        })
    }

    /// Remove every grant whose expiry has elapsed.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<RoleAssignment>, ServiceError> {
        let mut purged = Vec::new();
        for candidate in self.store.list_expired_assignments(now).await? {
            let Some(assignment) = self
                .store
                .delete_role_assignment(candidate.assignment_id)
                .await?
            else {
                continue;
            };
            let oracle_sync = self.pull_binding(&assignment).await;
            self.audit
                .append(
                    AuditRecord::new(
                        AuditAction::RoleExpired,
                        EntityType::RoleAssignment,
                        assignment.assignment_id,
                        "Role assignment expired",
                    )
                    .metadata(json!({
                        "user_id": assignment.user_id,
                        "role_id": assignment.role_id,
                        "repository_id": assignment.repository_id,
                        "expires_utc": assignment.expires_utc,
                        "oracle_sync": oracle_sync,
                    })),
                )
                .await;
            purged.push(assignment);
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "Purged expired role assignments");
        }
        Ok(purged)
    }

    /// Retry the oracle push for every grant not yet bound.
    #[instrument(skip(self))]
    pub async fn resync_pending(&self) -> Result<ResyncReport, ServiceError> {
        let mut report = ResyncReport::default();
        for assignment in self.store.list_unsynced_assignments().await? {
            match self.push_binding(&assignment).await {
                Ok(()) => {
                    report.synced += 1;
                    self.audit
                        .append(
                            AuditRecord::new(
                                AuditAction::OracleResynced,
                                EntityType::RoleAssignment,
                                assignment.assignment_id,
                                "Role binding pushed to the authorization oracle",
                            )
                            .metadata(json!({ "request_id": assignment.request_id })),
                        )
                        .await;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(assignment_id = %assignment.assignment_id, error = %e, "Oracle resync failed");
                }
            }
        }
        if report.synced + report.failed > 0 {
            info!(synced = report.synced, failed = report.failed, "Oracle resync finished");
        }
        Ok(report)
    }

    /// Push the organization's resource type, roles and repository owners to
    /// the oracle. Safe to repeat.
    #[instrument(skip(self))]
    pub async fn provision_catalog(&self, organization_id: Uuid) -> Result<CatalogReport, ServiceError> {
        let roles = self.store.list_roles(organization_id).await?;
        let repositories = self.store.list_repositories(organization_id).await?;

        let actions =
            ordered_action_set(roles.iter().flat_map(|role| role.actions.iter().cloned()));
        self.oracle
            .provision_resource(&ResourceDefinition {
                key: Repository::RESOURCE_TYPE.to_string(),
                name: "Repository".to_string(),
                actions: actions.clone(),
            })
            .await?;

        for role in &roles {
            self.oracle.provision_role(&role_definition(role)).await?;
        }

        let owners: BTreeSet<Uuid> = repositories.iter().map(|r| r.owner_id).collect();
        let mut principals = 0;
        for owner_id in owners {
            if let Some(user) = self.store.find_user(owner_id).await? {
                self.oracle
                    .sync_principal(&Principal {
                        user_id: user.user_id,
                        attributes: user.profile_attributes(),
                    })
                    .await?;
                principals += 1;
            }
        }

        info!(roles = roles.len(), principals, "Oracle catalog provisioned");
        Ok(CatalogReport {
            actions: actions.len(),
            roles: roles.len(),
            principals,
        })
    }

    /// Fail-closed permission check against the oracle.
    pub async fn check(&self, user_id: Uuid, action: &str, repository_id: Uuid) -> bool {
        self.oracle
            .check(&PermissionQuery {
                user_id,
                action: action.to_string(),
                resource_type: Repository::RESOURCE_TYPE.to_string(),
                resource_instance: Some(repository_id.to_string()),
            })
            .await
    }

    async fn push_binding(&self, assignment: &RoleAssignment) -> Result<(), ServiceError> {
        let role = self.role(assignment.role_id).await?;
        let user = self
            .store
            .find_user(assignment.user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User", assignment.user_id))?;

        self.oracle
            .sync_principal(&Principal {
                user_id: user.user_id,
                attributes: user.profile_attributes(),
            })
            .await?;
        self.oracle.provision_role(&role_definition(&role)).await?;
        self.oracle.bind_role(&binding(assignment, &role)).await?;
        self.store
            .mark_assignment_synced(assignment.assignment_id)
            .await
    }

    async fn pull_binding(&self, assignment: &RoleAssignment) -> SideEffect {
        let role = match self.role(assignment.role_id).await {
            Ok(role) => role,
            Err(e) => return SideEffect::failed(e),
        };
        match self.oracle.unbind_role(&binding(assignment, &role)).await {
            Ok(()) => SideEffect::Succeeded,
            Err(e) => {
                ERRORS_TOTAL.with_label_values(&["oracle_sync"]).inc();
                warn!(assignment_id = %assignment.assignment_id, error = %e, "Oracle unbind failed");
                SideEffect::failed(e)
            }
        }
    }

    async fn role(&self, role_id: Uuid) -> Result<Role, ServiceError> {
        self.store
            .find_role(role_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Role", role_id))
    }

    async fn repository(&self, repository_id: Uuid) -> Result<Repository, ServiceError> {
        self.store
            .find_repository(repository_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Repository", repository_id))
    }
}

fn role_definition(role: &Role) -> RoleDefinition {
    RoleDefinition {
        key: role.role_key.clone(),
        name: role.role_label.clone(),
        permissions: role.permission_keys(),
    }
}

fn binding(assignment: &RoleAssignment, role: &Role) -> RoleBinding {
    RoleBinding {
        user_id: assignment.user_id,
        role_key: role.role_key.clone(),
        resource_type: Repository::RESOURCE_TYPE.to_string(),
        resource_instance: Some(assignment.repository_id.to_string()),
    }
}
