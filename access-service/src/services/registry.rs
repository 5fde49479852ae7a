//! Access request registry: creation, validity checks, reads and expiry.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::audit::AuditRecorder;
use super::metrics::ACCESS_REQUESTS_TOTAL;
use super::notification::{Notification, NotificationDispatcher};
use super::store::AccessStore;
use super::ServiceError;
use crate::models::{
    ordered_action_set, AccessRequest, AccessRequestFilter, AuditAction, AuditRecord,
    ClientContext, EntityType, NewAccessRequest, Page, Repository, RequestClosure,
};

/// Raw creation input, before validation.
#[derive(Debug, Clone, Default)]
pub struct CreateAccessRequest {
    pub requester_id: Uuid,
    pub repository_id: Uuid,
    pub role_id: Option<Uuid>,
    pub actions: Option<Vec<String>>,
    pub reason: String,
    pub approver_ids: Option<Vec<Uuid>>,
    pub requires_multi_approval: Option<bool>,
    pub expires_utc: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct AccessRequestRegistry {
    store: Arc<dyn AccessStore>,
    audit: AuditRecorder,
    notifications: NotificationDispatcher,
}

impl AccessRequestRegistry {
    pub fn new(
        store: Arc<dyn AccessStore>,
        audit: AuditRecorder,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            audit,
            notifications,
        }
    }

    /// Validate and persist a new PENDING request.
    #[instrument(skip(self, input, context), fields(requester_id = %input.requester_id, repository_id = %input.repository_id))]
    pub async fn create(
        &self,
        input: CreateAccessRequest,
        context: &ClientContext,
    ) -> Result<AccessRequest, ServiceError> {
        let now = Utc::now();
        let actions = ordered_action_set(input.actions.unwrap_or_default());

        match (input.role_id, actions.is_empty()) {
            (Some(_), false) => {
                return Err(ServiceError::Validation(
                    "Specify either a role or a list of actions, not both".to_string(),
                ))
            }
            (None, true) => {
                return Err(ServiceError::Validation(
                    "A role or a non-empty list of actions is required".to_string(),
                ))
            }
            _ => {}
        }
        if input.expires_utc.is_some_and(|at| at <= now) {
            return Err(ServiceError::Validation(
                "expires_utc must be in the future".to_string(),
            ));
        }

        let repository = self.repository(input.repository_id).await?;
        if self.store.find_user(input.requester_id).await?.is_none() {
            return Err(ServiceError::not_found("User", input.requester_id));
        }
        if repository.is_owned_by(input.requester_id) {
            return Err(ServiceError::Validation(
                "Repository owners cannot request access to their own repository".to_string(),
            ));
        }
        if let Some(role_id) = input.role_id {
            let role = self
                .store
                .find_role(role_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("Role", role_id))?;
            if role.organization_id != repository.organization_id {
                return Err(ServiceError::Validation(
                    "Role does not belong to the repository's organization".to_string(),
                ));
            }
        }

        let mut approver_ids: Vec<Uuid> = Vec::new();
        for id in input.approver_ids.unwrap_or_default() {
            if id == input.requester_id {
                return Err(ServiceError::Validation(
                    "Requesters cannot approve their own request".to_string(),
                ));
            }
            // The owner always approves; listing them again would skew the quorum.
            if !repository.is_owned_by(id) && !approver_ids.contains(&id) {
                approver_ids.push(id);
            }
        }

        let request = NewAccessRequest {
            requester_id: input.requester_id,
            repository_id: input.repository_id,
            role_id: input.role_id,
            requested_actions: actions,
            reason: input.reason.trim().to_string(),
            approver_ids,
            requires_multi_approval: input.requires_multi_approval.unwrap_or(false),
            expires_utc: input.expires_utc,
        }
        .into_pending(now);

        self.store.insert_access_request(&request).await?;
        ACCESS_REQUESTS_TOTAL.with_label_values(&["created"]).inc();
        info!(request_id = %request.request_id, "Access request created");

        self.audit
            .append(
                AuditRecord::new(
                    AuditAction::Created,
                    EntityType::AccessRequest,
                    request.request_id,
                    format!("Access requested to repository {}", repository.name),
                )
                .actor(request.requester_id)
                .metadata(json!({
                    "repository_id": request.repository_id,
                    "role_id": request.role_id,
                    "requested_actions": request.requested_actions,
                    "approver_ids": request.approver_ids,
                    "requires_multi_approval": request.requires_multi_approval,
                    "required_approvals": request.required_approvals(),
                    "expires_utc": request.expires_utc,
                }))
                .context(context),
            )
            .await;

        let recipients = std::iter::once(repository.owner_id).chain(request.approver_ids.iter().copied());
        let notifications = recipients
            .map(|user_id| {
                Notification::new(
                    user_id,
                    "New access request",
                    format!("Access to {} is awaiting your decision", repository.name),
                    json!({ "request_id": request.request_id }),
                )
            })
            .collect();
        self.notifications.dispatch(notifications).await;

        Ok(request)
    }

    pub async fn get(&self, request_id: Uuid) -> Result<AccessRequest, ServiceError> {
        self.store
            .find_access_request(request_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Access request", request_id))
    }

    /// Fetch a request on behalf of `viewer`, who must participate in it.
    pub async fn get_for(
        &self,
        request_id: Uuid,
        viewer_id: Uuid,
    ) -> Result<AccessRequest, ServiceError> {
        let request = self.get(request_id).await?;
        let repository = self.repository(request.repository_id).await?;
        if !request.is_visible_to(viewer_id, repository.owner_id) {
            return Err(ServiceError::Authorization(
                "Not allowed to view this access request".to_string(),
            ));
        }
        Ok(request)
    }

    pub async fn list(
        &self,
        filter: &AccessRequestFilter,
    ) -> Result<Page<AccessRequest>, ServiceError> {
        self.store.list_access_requests(filter).await
    }

    /// Move every PENDING request whose expiry has elapsed to EXPIRED.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<AccessRequest>, ServiceError> {
        let lapsed = self.store.find_lapsed_requests(now).await?;
        let mut expired = Vec::with_capacity(lapsed.len());

        for candidate in lapsed {
            let request = match self
                .store
                .close_request(candidate.request_id, &RequestClosure::Expired, now)
                .await
            {
                Ok(request) => request,
                Err(ServiceError::Conflict(reason)) => {
                    debug!(request_id = %candidate.request_id, %reason, "Request decided before expiry");
                    continue;
                }
                Err(e) => {
                    warn!(request_id = %candidate.request_id, error = %e, "Failed to expire request");
                    continue;
                }
            };

            ACCESS_REQUESTS_TOTAL.with_label_values(&["expired"]).inc();
            self.audit
                .append(
                    AuditRecord::new(
                        AuditAction::Expired,
                        EntityType::AccessRequest,
                        request.request_id,
                        "Access request expired before a decision",
                    )
                    .metadata(json!({
                        "expires_utc": request.expires_utc,
                        "approval_count": request.approval_count,
                    })),
                )
                .await;
            self.notifications
                .dispatch(vec![Notification::new(
                    request.requester_id,
                    "Access request expired",
                    "Your access request expired before it was decided",
                    json!({ "request_id": request.request_id }),
                )])
                .await;
            expired.push(request);
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired stale access requests");
        }
        Ok(expired)
    }

    async fn repository(&self, repository_id: Uuid) -> Result<Repository, ServiceError> {
        self.store
            .find_repository(repository_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Repository", repository_id))
    }
}
