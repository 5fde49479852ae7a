//! Approval quorum coordinator.
//!
//! Single-approval requests finalize on the first authorized approval.
//! Multi-approval requests count one step per distinct approver inside the
//! store's per-request atomic unit. The step that reaches the quorum moves the
//! request to APPROVED and inserts its grant in that same unit, so exactly one
//! caller finalizes and no failure can strand a request at a full tally.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::assignments::{FinalizeOutcome, RoleAssignmentManager};
use super::audit::AuditRecorder;
use super::biometric::BiometricVerifier;
use super::metrics::{ACCESS_REQUESTS_TOTAL, BIOMETRIC_CHECKS_TOTAL};
use super::notification::{Notification, NotificationDispatcher};
use super::store::AccessStore;
use super::ServiceError;
use crate::models::{
    AccessRequest, ApprovalTally, AuditAction, AuditRecord, ClientContext, EntityType,
    Repository, RequestClosure, TransitionError,
};

/// What an accepted approval did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// A step was counted; the quorum is still open.
    Recorded {
        request: AccessRequest,
        approval_count: u32,
        required: u32,
    },
    /// The request is now APPROVED.
    Finalized(FinalizeOutcome),
}

impl ApprovalDecision {
    pub fn request(&self) -> &AccessRequest {
        match self {
            ApprovalDecision::Recorded { request, .. } => request,
            ApprovalDecision::Finalized(outcome) => &outcome.request,
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, ApprovalDecision::Finalized(_))
    }
}

#[derive(Clone)]
pub struct ApprovalCoordinator {
    store: Arc<dyn AccessStore>,
    assignments: RoleAssignmentManager,
    verifier: Arc<dyn BiometricVerifier>,
    audit: AuditRecorder,
    notifications: NotificationDispatcher,
}

impl ApprovalCoordinator {
    pub fn new(
        store: Arc<dyn AccessStore>,
        assignments: RoleAssignmentManager,
        verifier: Arc<dyn BiometricVerifier>,
        audit: AuditRecorder,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            assignments,
            verifier,
            audit,
            notifications,
        }
    }

    #[instrument(skip(self, biometric_token, context), fields(request_id = %request_id, actor_id = %actor_id))]
    pub async fn approve(
        &self,
        request_id: Uuid,
        actor_id: Uuid,
        biometric_token: &str,
        context: &ClientContext,
    ) -> Result<ApprovalDecision, ServiceError> {
        let (request, repository) = self.decidable(request_id, actor_id).await?;
        self.verify_presence(&request, actor_id, biometric_token).await?;

        if !request.requires_multi_approval {
            let outcome = self
                .assignments
                .finalize(&request, &repository, actor_id, context)
                .await?;
            return Ok(ApprovalDecision::Finalized(outcome));
        }

        let grant = RoleAssignmentManager::grant_for(&request);
        let (request, tally) = self
            .store
            .record_approval(request_id, actor_id, chrono::Utc::now(), grant.as_ref())
            .await?;
        ACCESS_REQUESTS_TOTAL
            .with_label_values(&["approval_step"])
            .inc();
        info!(progress = %tally, "Approval step recorded");

        self.audit
            .append(
                AuditRecord::new(
                    AuditAction::ApprovalStep,
                    EntityType::AccessRequest,
                    request_id,
                    format!("Approval {}", tally),
                )
                .actor(actor_id)
                .metadata(json!({
                    "approval_count": tally.approval_count,
                    "required": tally.required,
                }))
                .context(context),
            )
            .await;

        if tally.quorum_reached() {
            // The store already committed APPROVED and the grant with this step.
            let outcome = self
                .assignments
                .complete_approval(request, grant, &repository, actor_id, context)
                .await;
            return Ok(ApprovalDecision::Finalized(outcome));
        }

        self.notify_progress(&request, &repository, &tally).await;
        Ok(ApprovalDecision::Recorded {
            request,
            approval_count: tally.approval_count,
            required: tally.required,
        })
    }

    /// Close the request as REJECTED. One authorized actor suffices, even
    /// under multi-approval.
    #[instrument(skip(self, reason, context), fields(request_id = %request_id, actor_id = %actor_id))]
    pub async fn reject(
        &self,
        request_id: Uuid,
        actor_id: Uuid,
        reason: Option<String>,
        context: &ClientContext,
    ) -> Result<AccessRequest, ServiceError> {
        let (_, repository) = self.decidable(request_id, actor_id).await?;
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        let request = self
            .store
            .close_request(
                request_id,
                &RequestClosure::Rejected {
                    actor_id,
                    reason: reason.clone(),
                },
                chrono::Utc::now(),
            )
            .await?;
        ACCESS_REQUESTS_TOTAL.with_label_values(&["rejected"]).inc();
        info!("Access request rejected");

        self.audit
            .append(
                AuditRecord::new(
                    AuditAction::Rejected,
                    EntityType::AccessRequest,
                    request_id,
                    format!("Access to repository {} rejected", repository.name),
                )
                .actor(actor_id)
                .metadata(json!({
                    "reason": reason,
                    "approval_count": request.approval_count,
                }))
                .context(context),
            )
            .await;

        self.notifications
            .dispatch(vec![Notification::new(
                request.requester_id,
                "Access rejected",
                match &reason {
                    Some(reason) => format!("Your access request for {} was rejected: {}", repository.name, reason),
                    None => format!("Your access request for {} was rejected", repository.name),
                },
                json!({ "request_id": request_id }),
            )])
            .await;

        Ok(request)
    }

    /// Checks shared by approve and reject, in order: existence, pending
    /// status, actor authority.
    async fn decidable(
        &self,
        request_id: Uuid,
        actor_id: Uuid,
    ) -> Result<(AccessRequest, Repository), ServiceError> {
        let request = self
            .store
            .find_access_request(request_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Access request", request_id))?;
        if !request.is_pending() {
            return Err(TransitionError::NotPending(request.status).into());
        }
        if request.has_lapsed_at(chrono::Utc::now()) {
            return Err(ServiceError::Conflict(
                "access request has passed its expiry".to_string(),
            ));
        }

        let repository = self
            .store
            .find_repository(request.repository_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Repository", request.repository_id))?;
        if !request.is_decidable_by(actor_id, repository.owner_id) {
            return Err(ServiceError::Authorization(
                "Only the repository owner or a designated approver may decide this request"
                    .to_string(),
            ));
        }
        Ok((request, repository))
    }

    /// Fail-closed: anything other than a positive verification rejects.
    async fn verify_presence(
        &self,
        request: &AccessRequest,
        actor_id: Uuid,
        token: &str,
    ) -> Result<(), ServiceError> {
        let enrolled = self
            .store
            .find_user(actor_id)
            .await?
            .is_some_and(|user| user.biometric_enabled);
        if !enrolled {
            BIOMETRIC_CHECKS_TOTAL
                .with_label_values(&["not_enrolled"])
                .inc();
            return Err(ServiceError::Verification(
                "Biometric approval is not enabled for this approver".to_string(),
            ));
        }

        match self.verifier.verify(request.request_id, actor_id, token).await {
            Ok(true) => {
                BIOMETRIC_CHECKS_TOTAL.with_label_values(&["verified"]).inc();
                Ok(())
            }
            Ok(false) => {
                BIOMETRIC_CHECKS_TOTAL.with_label_values(&["rejected"]).inc();
                Err(ServiceError::Verification(
                    "Biometric verification failed".to_string(),
                ))
            }
            Err(e) => {
                BIOMETRIC_CHECKS_TOTAL
                    .with_label_values(&["unavailable"])
                    .inc();
                warn!(error = %e, "Biometric verifier error, rejecting approval");
                Err(ServiceError::Verification(
                    "Biometric verification failed".to_string(),
                ))
            }
        }
    }

    async fn notify_progress(&self, request: &AccessRequest, repository: &Repository, tally: &ApprovalTally) {
        self.notifications
            .dispatch(vec![Notification::new(
                request.requester_id,
                "Approval received",
                format!("Access to {}: approval {}", repository.name, tally),
                json!({
                    "request_id": request.request_id,
                    "approval_count": tally.approval_count,
                    "required": tally.required,
                }),
            )])
            .await;
    }
}
