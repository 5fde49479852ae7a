//! Persistence boundary for access-service.
//!
//! Every component receives an `Arc<dyn AccessStore>` through its constructor.
//! Methods that mutate an access request run the whole
//! read-check-write sequence as one atomic unit scoped to that request.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    AccessRequest, AccessRequestFilter, ApprovalTally, AuditLogEntry, AuditQuery, AuditRecord,
    Organization, Page, Repository, RequestClosure, Role, RoleAssignment, User,
};
use crate::services::ServiceError;

#[async_trait]
pub trait AccessStore: Send + Sync {
    async fn health_check(&self) -> Result<(), ServiceError>;

    // ==================== Catalog ====================

    async fn insert_user(&self, user: &User) -> Result<(), ServiceError>;

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError>;

    async fn insert_organization(&self, organization: &Organization) -> Result<(), ServiceError>;

    async fn insert_repository(&self, repository: &Repository) -> Result<(), ServiceError>;

    async fn find_repository(&self, repository_id: Uuid)
        -> Result<Option<Repository>, ServiceError>;

    async fn list_repositories(&self, organization_id: Uuid)
        -> Result<Vec<Repository>, ServiceError>;

    async fn insert_role(&self, role: &Role) -> Result<(), ServiceError>;

    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, ServiceError>;

    async fn list_roles(&self, organization_id: Uuid) -> Result<Vec<Role>, ServiceError>;

    // ==================== Access Requests ====================

    /// Persist a new PENDING request. Fails with `Conflict` when the
    /// requester already has a pending request for the same repository.
    async fn insert_access_request(&self, request: &AccessRequest) -> Result<(), ServiceError>;

    async fn find_access_request(&self, request_id: Uuid)
        -> Result<Option<AccessRequest>, ServiceError>;

    /// Newest first.
    async fn list_access_requests(
        &self,
        filter: &AccessRequestFilter,
    ) -> Result<Page<AccessRequest>, ServiceError>;

    /// Atomically count one approval step and report the new tally.
    ///
    /// The step that reaches the quorum also moves the request to APPROVED
    /// and inserts `assignment` in the same unit, so a request can never be
    /// left pending with a full tally.
    async fn record_approval(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
        at: DateTime<Utc>,
        assignment: Option<&RoleAssignment>,
    ) -> Result<(AccessRequest, ApprovalTally), ServiceError>;

    /// Atomically move a pending request to APPROVED and, when given, insert
    /// the role assignment in the same unit.
    async fn finalize_approval(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
        at: DateTime<Utc>,
        assignment: Option<&RoleAssignment>,
    ) -> Result<AccessRequest, ServiceError>;

    /// Atomically move a pending request to REJECTED or EXPIRED.
    async fn close_request(
        &self,
        request_id: Uuid,
        closure: &RequestClosure,
        at: DateTime<Utc>,
    ) -> Result<AccessRequest, ServiceError>;

    /// Pending requests whose expiry is at or before `now`.
    async fn find_lapsed_requests(&self, now: DateTime<Utc>)
        -> Result<Vec<AccessRequest>, ServiceError>;

    // ==================== Role Assignments ====================

    async fn find_role_assignment(
        &self,
        assignment_id: Uuid,
    ) -> Result<Option<RoleAssignment>, ServiceError>;

    async fn list_role_assignments_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RoleAssignment>, ServiceError>;

    async fn mark_assignment_synced(&self, assignment_id: Uuid) -> Result<(), ServiceError>;

    async fn list_unsynced_assignments(&self) -> Result<Vec<RoleAssignment>, ServiceError>;

    async fn list_expired_assignments(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoleAssignment>, ServiceError>;

    /// Remove an assignment, returning it when it existed.
    async fn delete_role_assignment(
        &self,
        assignment_id: Uuid,
    ) -> Result<Option<RoleAssignment>, ServiceError>;

    // ==================== Audit Trail ====================

    /// Append an entry; the store assigns id, sequence and timestamp.
    async fn append_audit_entry(&self, record: AuditRecord)
        -> Result<AuditLogEntry, ServiceError>;

    /// Most recent first.
    async fn query_audit_entries(
        &self,
        query: &AuditQuery,
    ) -> Result<Page<AuditLogEntry>, ServiceError>;

    async fn distinct_audit_actions(&self) -> Result<Vec<String>, ServiceError>;

    async fn distinct_audit_entity_types(&self) -> Result<Vec<String>, ServiceError>;
}
