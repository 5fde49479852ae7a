//! Access request model and its lifecycle state machine.
//!
//! A request starts PENDING and moves exactly once to APPROVED, REJECTED or
//! EXPIRED. Every mutation goes through the methods below so the Postgres and
//! in-memory stores apply identical rules inside their atomic sections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status of an access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRequestStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl AccessRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Only PENDING → {APPROVED, REJECTED, EXPIRED} is allowed.
    pub fn can_transition_to(&self, next: AccessRequestStatus) -> bool {
        matches!(self, Self::Pending) && next.is_terminal()
    }
}

impl fmt::Display for AccessRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccessRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(format!("Unknown access request status: {}", other)),
        }
    }
}

/// Why a state transition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("access request is already {0}")]
    NotPending(AccessRequestStatus),

    #[error("approver {0} has already approved this request")]
    DuplicateApproval(Uuid),

    #[error("approval quorum already reached ({0} approvals)")]
    QuorumAlreadyReached(u32),

    #[error("access request does not require multiple approvals")]
    SingleApproval,
}

/// How a pending request was closed without approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestClosure {
    Rejected {
        actor_id: Uuid,
        reason: Option<String>,
    },
    Expired,
}

impl RequestClosure {
    pub fn status(&self) -> AccessRequestStatus {
        match self {
            Self::Rejected { .. } => AccessRequestStatus::Rejected,
            Self::Expired => AccessRequestStatus::Expired,
        }
    }
}

/// Result of one counted approval step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalTally {
    pub approval_count: u32,
    pub required: u32,
}

impl ApprovalTally {
    /// True only for the step whose increment reached the quorum.
    pub fn quorum_reached(&self) -> bool {
        self.approval_count == self.required
    }
}

impl fmt::Display for ApprovalTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.approval_count, self.required)
    }
}

/// Access request entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub request_id: Uuid,
    pub requester_id: Uuid,
    pub repository_id: Uuid,
    /// Requested role. Mutually exclusive with `requested_actions`.
    pub role_id: Option<Uuid>,
    /// Explicit actions requested when no role is referenced.
    pub requested_actions: Vec<String>,
    pub reason: String,
    pub status: AccessRequestStatus,
    /// Designated approvers in addition to the repository owner.
    pub approver_ids: Vec<Uuid>,
    pub requires_multi_approval: bool,
    pub approval_count: u32,
    /// Approvers that have contributed an approval step, in order.
    pub approved_by: Vec<Uuid>,
    pub finalized_by: Option<Uuid>,
    pub finalized_utc: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub expires_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl AccessRequest {
    /// Approvals needed under multi-approval: every designated approver plus
    /// the owner.
    pub fn required_approvals(&self) -> u32 {
        self.approver_ids.len() as u32 + 1
    }

    pub fn is_pending(&self) -> bool {
        self.status == AccessRequestStatus::Pending
    }

    pub fn carries_role(&self) -> bool {
        self.role_id.is_some()
    }

    /// A pending request whose expiry has elapsed can no longer be decided.
    pub fn has_lapsed_at(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_utc.is_some_and(|at| at <= now)
    }

    /// Owner or designated approver.
    pub fn is_decidable_by(&self, actor_id: Uuid, owner_id: Uuid) -> bool {
        actor_id == owner_id || self.approver_ids.contains(&actor_id)
    }

    /// Whether `user_id` may read this request.
    pub fn is_visible_to(&self, user_id: Uuid, owner_id: Uuid) -> bool {
        self.requester_id == user_id
            || self.finalized_by == Some(user_id)
            || self.is_decidable_by(user_id, owner_id)
    }

    /// Count one approval step. Must run inside the request's atomic section.
    pub fn register_approval(
        &mut self,
        approver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ApprovalTally, TransitionError> {
        self.ensure_pending()?;
        if !self.requires_multi_approval {
            return Err(TransitionError::SingleApproval);
        }
        if self.approved_by.contains(&approver_id) {
            return Err(TransitionError::DuplicateApproval(approver_id));
        }
        let required = self.required_approvals();
        if self.approval_count >= required {
            return Err(TransitionError::QuorumAlreadyReached(self.approval_count));
        }

        self.approval_count += 1;
        self.approved_by.push(approver_id);
        self.updated_utc = at;

        Ok(ApprovalTally {
            approval_count: self.approval_count,
            required,
        })
    }

    /// Move to APPROVED, recording the single finalizing approver.
    pub fn finalize(&mut self, approver_id: Uuid, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_pending()?;
        self.status = AccessRequestStatus::Approved;
        self.finalized_by = Some(approver_id);
        self.finalized_utc = Some(at);
        self.updated_utc = at;
        Ok(())
    }

    /// Move to REJECTED or EXPIRED.
    pub fn close(&mut self, closure: &RequestClosure, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_pending()?;
        self.status = closure.status();
        if let RequestClosure::Rejected { actor_id, reason } = closure {
            self.finalized_by = Some(*actor_id);
            self.rejection_reason = reason.clone();
        }
        self.finalized_utc = Some(at);
        self.updated_utc = at;
        Ok(())
    }

    fn ensure_pending(&self) -> Result<(), TransitionError> {
        if self.is_pending() {
            Ok(())
        } else {
            Err(TransitionError::NotPending(self.status))
        }
    }
}

/// Validated input for a new access request.
#[derive(Debug, Clone)]
pub struct NewAccessRequest {
    pub requester_id: Uuid,
    pub repository_id: Uuid,
    pub role_id: Option<Uuid>,
    pub requested_actions: Vec<String>,
    pub reason: String,
    pub approver_ids: Vec<Uuid>,
    pub requires_multi_approval: bool,
    pub expires_utc: Option<DateTime<Utc>>,
}

impl NewAccessRequest {
    /// Materialize the PENDING entity.
    pub fn into_pending(self, now: DateTime<Utc>) -> AccessRequest {
        AccessRequest {
            request_id: Uuid::new_v4(),
            requester_id: self.requester_id,
            repository_id: self.repository_id,
            role_id: self.role_id,
            requested_actions: self.requested_actions,
            reason: self.reason,
            status: AccessRequestStatus::Pending,
            approver_ids: self.approver_ids,
            requires_multi_approval: self.requires_multi_approval,
            approval_count: 0,
            approved_by: Vec::new(),
            finalized_by: None,
            finalized_utc: None,
            rejection_reason: None,
            expires_utc: self.expires_utc,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Derived request type used by list views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Pending,
    Approved,
    Rejected,
    #[default]
    All,
}

impl RequestType {
    pub fn status(&self) -> Option<AccessRequestStatus> {
        match self {
            Self::Pending => Some(AccessRequestStatus::Pending),
            Self::Approved => Some(AccessRequestStatus::Approved),
            Self::Rejected => Some(AccessRequestStatus::Rejected),
            Self::All => None,
        }
    }
}

/// Which side of a request the caller is looking from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    Requester,
    Approver,
    #[default]
    Any,
}

impl CallerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Approver => "approver",
            Self::Any => "any",
        }
    }
}

/// Filters for listing access requests.
#[derive(Debug, Clone, Default)]
pub struct AccessRequestFilter {
    pub status: Option<AccessRequestStatus>,
    pub request_type: RequestType,
    /// Restrict to requests the caller participates in; `None` lists all.
    pub caller: Option<(Uuid, CallerRole)>,
    pub page: u32,
    pub per_page: u32,
}

impl AccessRequestFilter {
    /// True when `request` passes the status and type filters.
    pub fn matches_status(&self, request: &AccessRequest) -> bool {
        self.status.is_none_or(|s| s == request.status)
            && self.request_type.status().is_none_or(|s| s == request.status)
    }

    /// True when the caller participates in `request` in the requested role.
    ///
    /// Owners are implicit approvers of pending requests on their
    /// repositories even when not listed.
    pub fn matches_caller(&self, request: &AccessRequest, owner_id: Uuid) -> bool {
        let Some((caller, role)) = self.caller else {
            return true;
        };
        let as_requester = request.requester_id == caller;
        let as_approver = request.finalized_by == Some(caller)
            || request.approver_ids.contains(&caller)
            || (request.is_pending() && owner_id == caller);
        match role {
            CallerRole::Requester => as_requester,
            CallerRole::Approver => as_approver,
            CallerRole::Any => as_requester || as_approver,
        }
    }
}
