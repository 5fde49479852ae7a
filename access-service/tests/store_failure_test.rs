//! Approval behaviour when the store fails part-way through a decision.

mod common;

use access_service::models::{
    AccessRequest, AccessRequestFilter, AccessRequestStatus, ApprovalTally, AuditLogEntry,
    AuditQuery, AuditRecord, ClientContext, Organization, Page, Repository, RequestClosure, Role,
    RoleAssignment, User,
};
use access_service::services::{AccessStore, ApprovalDecision, MemoryStore, ServiceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::TestApp;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Delegates to a [`MemoryStore`], failing selected writes on demand.
struct FlakyStore {
    inner: Arc<MemoryStore>,
    /// Fail the next approval step that would reach the quorum.
    fail_quorum_step: AtomicBool,
    /// Fail every standalone finalize.
    fail_finalize: AtomicBool,
    finalize_calls: AtomicU64,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_quorum_step: AtomicBool::new(false),
            fail_finalize: AtomicBool::new(false),
            finalize_calls: AtomicU64::new(0),
        }
    }

    fn blip() -> ServiceError {
        ServiceError::Internal("transient db blip".to_string())
    }
}

#[async_trait]
impl AccessStore for FlakyStore {
    async fn health_check(&self) -> Result<(), ServiceError> {
        self.inner.health_check().await
    }

    async fn insert_user(&self, user: &User) -> Result<(), ServiceError> {
        self.inner.insert_user(user).await
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        self.inner.find_user(user_id).await
    }

    async fn insert_organization(&self, organization: &Organization) -> Result<(), ServiceError> {
        self.inner.insert_organization(organization).await
    }

    async fn insert_repository(&self, repository: &Repository) -> Result<(), ServiceError> {
        self.inner.insert_repository(repository).await
    }

    async fn find_repository(
        &self,
        repository_id: Uuid,
    ) -> Result<Option<Repository>, ServiceError> {
        self.inner.find_repository(repository_id).await
    }

    async fn list_repositories(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<Repository>, ServiceError> {
        self.inner.list_repositories(organization_id).await
    }

    async fn insert_role(&self, role: &Role) -> Result<(), ServiceError> {
        self.inner.insert_role(role).await
    }

    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, ServiceError> {
        self.inner.find_role(role_id).await
    }

    async fn list_roles(&self, organization_id: Uuid) -> Result<Vec<Role>, ServiceError> {
        self.inner.list_roles(organization_id).await
    }

    async fn insert_access_request(&self, request: &AccessRequest) -> Result<(), ServiceError> {
        self.inner.insert_access_request(request).await
    }

    async fn find_access_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<AccessRequest>, ServiceError> {
        self.inner.find_access_request(request_id).await
    }

    async fn list_access_requests(
        &self,
        filter: &AccessRequestFilter,
    ) -> Result<Page<AccessRequest>, ServiceError> {
        self.inner.list_access_requests(filter).await
    }

    async fn record_approval(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
        at: DateTime<Utc>,
        assignment: Option<&RoleAssignment>,
    ) -> Result<(AccessRequest, ApprovalTally), ServiceError> {
        if let Some(current) = self.inner.find_access_request(request_id).await? {
            let reaches_quorum = current.approval_count + 1 == current.required_approvals();
            if reaches_quorum && self.fail_quorum_step.swap(false, Ordering::SeqCst) {
                return Err(Self::blip());
            }
        }
        self.inner
            .record_approval(request_id, approver_id, at, assignment)
            .await
    }

    async fn finalize_approval(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
        at: DateTime<Utc>,
        assignment: Option<&RoleAssignment>,
    ) -> Result<AccessRequest, ServiceError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_finalize.load(Ordering::SeqCst) {
            return Err(Self::blip());
        }
        self.inner
            .finalize_approval(request_id, approver_id, at, assignment)
            .await
    }

    async fn close_request(
        &self,
        request_id: Uuid,
        closure: &RequestClosure,
        at: DateTime<Utc>,
    ) -> Result<AccessRequest, ServiceError> {
        self.inner.close_request(request_id, closure, at).await
    }

    async fn find_lapsed_requests(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AccessRequest>, ServiceError> {
        self.inner.find_lapsed_requests(now).await
    }

    async fn find_role_assignment(
        &self,
        assignment_id: Uuid,
    ) -> Result<Option<RoleAssignment>, ServiceError> {
        self.inner.find_role_assignment(assignment_id).await
    }

    async fn list_role_assignments_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RoleAssignment>, ServiceError> {
        self.inner.list_role_assignments_for_user(user_id).await
    }

    async fn mark_assignment_synced(&self, assignment_id: Uuid) -> Result<(), ServiceError> {
        self.inner.mark_assignment_synced(assignment_id).await
    }

    async fn list_unsynced_assignments(&self) -> Result<Vec<RoleAssignment>, ServiceError> {
        self.inner.list_unsynced_assignments().await
    }

    async fn list_expired_assignments(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoleAssignment>, ServiceError> {
        self.inner.list_expired_assignments(now).await
    }

    async fn delete_role_assignment(
        &self,
        assignment_id: Uuid,
    ) -> Result<Option<RoleAssignment>, ServiceError> {
        self.inner.delete_role_assignment(assignment_id).await
    }

    async fn append_audit_entry(
        &self,
        record: AuditRecord,
    ) -> Result<AuditLogEntry, ServiceError> {
        self.inner.append_audit_entry(record).await
    }

    async fn query_audit_entries(
        &self,
        query: &AuditQuery,
    ) -> Result<Page<AuditLogEntry>, ServiceError> {
        self.inner.query_audit_entries(query).await
    }

    async fn distinct_audit_actions(&self) -> Result<Vec<String>, ServiceError> {
        self.inner.distinct_audit_actions().await
    }

    async fn distinct_audit_entity_types(&self) -> Result<Vec<String>, ServiceError> {
        self.inner.distinct_audit_entity_types().await
    }
}

#[tokio::test]
async fn failed_quorum_step_leaves_the_request_decidable() {
    // Arrange
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app.request_role_with_quorum(&seed).await;
    let flaky = Arc::new(FlakyStore::new(app.store.clone()));
    let workflow = app.workflow_over(flaky.clone());
    let ctx = ClientContext::default();
    let last = seed.approvers[1].user_id;

    for actor in [seed.owner.user_id, seed.approvers[0].user_id] {
        let token = app.token(request.request_id, actor);
        let decision = workflow
            .coordinator
            .approve(request.request_id, actor, &token, &ctx)
            .await
            .unwrap();
        assert!(!decision.is_finalized());
    }

    // Act
    flaky.fail_quorum_step.store(true, Ordering::SeqCst);
    let token = app.token(request.request_id, last);
    let failed = workflow
        .coordinator
        .approve(request.request_id, last, &token, &ctx)
        .await;

    // Assert
    assert!(matches!(failed, Err(ServiceError::Internal(_))));
    let stored = workflow.registry.get(request.request_id).await.unwrap();
    assert_eq!(stored.status, AccessRequestStatus::Pending);
    assert_eq!(stored.approval_count, 2);
    assert_eq!(app.store.assignment_count(), 0);

    let retried = workflow
        .coordinator
        .approve(request.request_id, last, &token, &ctx)
        .await
        .unwrap();
    assert!(retried.is_finalized());

    let stored = workflow.registry.get(request.request_id).await.unwrap();
    assert_eq!(stored.status, AccessRequestStatus::Approved);
    assert_eq!(stored.approval_count, 3);
    assert_eq!(stored.finalized_by, Some(last));
    assert_eq!(app.store.assignment_count(), 1);
}

#[tokio::test]
async fn quorum_approval_commits_without_a_separate_finalize() {
    // Arrange
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app.request_role_with_quorum(&seed).await;
    let flaky = Arc::new(FlakyStore::new(app.store.clone()));
    flaky.fail_finalize.store(true, Ordering::SeqCst);
    let workflow = app.workflow_over(flaky.clone());
    let ctx = ClientContext::default();
    let deciders: Vec<_> = std::iter::once(seed.owner.user_id)
        .chain(seed.approvers.iter().map(|u| u.user_id))
        .collect();

    // Act
    let mut decisions = Vec::new();
    for actor in deciders {
        let token = app.token(request.request_id, actor);
        decisions.push(
            workflow
                .coordinator
                .approve(request.request_id, actor, &token, &ctx)
                .await
                .unwrap(),
        );
    }

    // Assert
    assert_eq!(flaky.finalize_calls.load(Ordering::SeqCst), 0);
    match decisions.last() {
        Some(ApprovalDecision::Finalized(outcome)) => {
            let grant = outcome.assignment.as_ref().expect("role request issues a grant");
            assert!(grant.oracle_synced);
        }
        other => panic!("expected the last approval to finalize, got {:?}", other),
    }
    assert_eq!(app.oracle.bindings_for(seed.requester.user_id).len(), 1);
}

#[tokio::test]
async fn rejection_after_the_quorum_step_conflicts() {
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app.request_role_with_quorum(&seed).await;
    let ctx = ClientContext::default();
    for actor in std::iter::once(seed.owner.user_id).chain(seed.approvers.iter().map(|u| u.user_id)) {
        let token = app.token(request.request_id, actor);
        app.workflow
            .coordinator
            .approve(request.request_id, actor, &token, &ctx)
            .await
            .unwrap();
    }

    let rejected = app
        .workflow
        .coordinator
        .reject(request.request_id, seed.owner.user_id, None, &ctx)
        .await;

    assert!(matches!(rejected, Err(ServiceError::Conflict(_))));
    let stored = app.workflow.registry.get(request.request_id).await.unwrap();
    assert_eq!(stored.status, AccessRequestStatus::Approved);
}
