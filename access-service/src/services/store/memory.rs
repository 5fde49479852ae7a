//! In-process store for development and tests.
//!
//! Per-request atomicity comes from the dashmap entry lock: every mutation of
//! an access request happens while holding `get_mut` on that one entry (and
//! its pending-pair slot), so unrelated requests rarely contend. The
//! one-pending-per-pair invariant is kept by `pending_index`, claimed through
//! the entry API before the request is inserted and released inside the same
//! section that moves the request out of PENDING.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::AccessStore;
use crate::models::{
    AccessRequest, AccessRequestFilter, ApprovalTally, AuditLogEntry, AuditQuery, AuditRecord,
    Organization, Page, Repository, RequestClosure, Role, RoleAssignment, User,
};
use crate::services::ServiceError;

#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    organizations: DashMap<Uuid, Organization>,
    repositories: DashMap<Uuid, Repository>,
    roles: DashMap<Uuid, Role>,
    requests: DashMap<Uuid, AccessRequest>,
    /// (requester, repository) → pending request id.
    pending_index: DashMap<(Uuid, Uuid), Uuid>,
    assignments: DashMap<Uuid, RoleAssignment>,
    audit: RwLock<Vec<AuditLogEntry>>,
    audit_unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an audit sink outage; appends fail while set.
    pub fn set_audit_available(&self, available: bool) {
        self.audit_unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of stored role assignments.
    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    /// Run `mutate` on one request inside its atomic section.
    ///
    /// Locks are taken pending-pair slot first, request entry second (the
    /// same order as `insert_access_request`). When the request leaves
    /// PENDING its slot is released before either lock is dropped.
    fn update_request<T>(
        &self,
        request_id: Uuid,
        mutate: impl FnOnce(&mut AccessRequest) -> Result<T, ServiceError>,
    ) -> Result<(AccessRequest, T), ServiceError> {
        let pair = self
            .requests
            .get(&request_id)
            .map(|r| (r.requester_id, r.repository_id))
            .ok_or_else(|| ServiceError::not_found("Access request", request_id))?;

        let slot = self.pending_index.entry(pair);
        let mut request = self
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| ServiceError::not_found("Access request", request_id))?;
        let output = mutate(request.value_mut())?;

        if !request.is_pending() {
            if let Entry::Occupied(slot) = slot {
                if *slot.get() == request_id {
                    slot.remove();
                }
            }
        }
        Ok((request.clone(), output))
    }

    fn owner_of(&self, repository_id: Uuid) -> Option<Uuid> {
        self.repositories.get(&repository_id).map(|r| r.owner_id)
    }
}

fn duplicate(entity: &str, id: Uuid) -> ServiceError {
    ServiceError::Conflict(format!("{} {} already exists", entity, id))
}

#[async_trait]
impl AccessStore for MemoryStore {
    async fn health_check(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn insert_user(&self, user: &User) -> Result<(), ServiceError> {
        match self.users.entry(user.user_id) {
            Entry::Occupied(_) => Err(duplicate("User", user.user_id)),
            Entry::Vacant(slot) => {
                slot.insert(user.clone());
                Ok(())
            }
        }
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn insert_organization(&self, organization: &Organization) -> Result<(), ServiceError> {
        match self.organizations.entry(organization.organization_id) {
            Entry::Occupied(_) => Err(duplicate("Organization", organization.organization_id)),
            Entry::Vacant(slot) => {
                slot.insert(organization.clone());
                Ok(())
            }
        }
    }

    async fn insert_repository(&self, repository: &Repository) -> Result<(), ServiceError> {
        if !self.organizations.contains_key(&repository.organization_id) {
            return Err(ServiceError::not_found(
                "Organization",
                repository.organization_id,
            ));
        }
        match self.repositories.entry(repository.repository_id) {
            Entry::Occupied(_) => Err(duplicate("Repository", repository.repository_id)),
            Entry::Vacant(slot) => {
                slot.insert(repository.clone());
                Ok(())
            }
        }
    }

    async fn find_repository(
        &self,
        repository_id: Uuid,
    ) -> Result<Option<Repository>, ServiceError> {
        Ok(self.repositories.get(&repository_id).map(|r| r.clone()))
    }

    async fn list_repositories(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<Repository>, ServiceError> {
        let mut repositories: Vec<Repository> = self
            .repositories
            .iter()
            .filter(|r| r.organization_id == organization_id)
            .map(|r| r.clone())
            .collect();
        repositories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repositories)
    }

    async fn insert_role(&self, role: &Role) -> Result<(), ServiceError> {
        if !self.organizations.contains_key(&role.organization_id) {
            return Err(ServiceError::not_found("Organization", role.organization_id));
        }
        match self.roles.entry(role.role_id) {
            Entry::Occupied(_) => Err(duplicate("Role", role.role_id)),
            Entry::Vacant(slot) => {
                slot.insert(role.clone());
                Ok(())
            }
        }
    }

    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, ServiceError> {
        Ok(self.roles.get(&role_id).map(|r| r.clone()))
    }

    async fn list_roles(&self, organization_id: Uuid) -> Result<Vec<Role>, ServiceError> {
        let mut roles: Vec<Role> = self
            .roles
            .iter()
            .filter(|r| r.organization_id == organization_id)
            .map(|r| r.clone())
            .collect();
        roles.sort_by(|a, b| a.role_key.cmp(&b.role_key));
        Ok(roles)
    }

    async fn insert_access_request(&self, request: &AccessRequest) -> Result<(), ServiceError> {
        match self
            .pending_index
            .entry((request.requester_id, request.repository_id))
        {
            Entry::Occupied(existing) => Err(ServiceError::Conflict(format!(
                "A pending access request ({}) already exists for this repository",
                existing.get()
            ))),
            Entry::Vacant(slot) => {
                self.requests.insert(request.request_id, request.clone());
                slot.insert(request.request_id);
                Ok(())
            }
        }
    }

    async fn find_access_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<AccessRequest>, ServiceError> {
        Ok(self.requests.get(&request_id).map(|r| r.clone()))
    }

    async fn list_access_requests(
        &self,
        filter: &AccessRequestFilter,
    ) -> Result<Page<AccessRequest>, ServiceError> {
        let snapshot: Vec<AccessRequest> = self.requests.iter().map(|r| r.clone()).collect();
        let mut matching: Vec<AccessRequest> = snapshot
            .into_iter()
            .filter(|r| filter.matches_status(r))
            .filter(|r| {
                self.owner_of(r.repository_id)
                    .is_some_and(|owner| filter.matches_caller(r, owner))
            })
            .collect();
        matching.sort_by(|a, b| {
            b.created_utc
                .cmp(&a.created_utc)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(Page::from_sorted(matching, filter.page, filter.per_page))
    }

    async fn record_approval(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
        at: DateTime<Utc>,
        assignment: Option<&RoleAssignment>,
    ) -> Result<(AccessRequest, ApprovalTally), ServiceError> {
        self.update_request(request_id, |request| {
            let tally = request.register_approval(approver_id, at)?;
            if tally.quorum_reached() {
                request.finalize(approver_id, at)?;
                if let Some(assignment) = assignment {
                    self.assignments
                        .insert(assignment.assignment_id, assignment.clone());
                }
            }
            Ok(tally)
        })
    }

    async fn finalize_approval(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
        at: DateTime<Utc>,
        assignment: Option<&RoleAssignment>,
    ) -> Result<AccessRequest, ServiceError> {
        let (approved, ()) = self.update_request(request_id, |request| {
            request.finalize(approver_id, at)?;
            if let Some(assignment) = assignment {
                self.assignments
                    .insert(assignment.assignment_id, assignment.clone());
            }
            Ok(())
        })?;
        Ok(approved)
    }

    async fn close_request(
        &self,
        request_id: Uuid,
        closure: &RequestClosure,
        at: DateTime<Utc>,
    ) -> Result<AccessRequest, ServiceError> {
        let (closed, ()) = self.update_request(request_id, |request| {
            request.close(closure, at)?;
            Ok(())
        })?;
        Ok(closed)
    }

    async fn find_lapsed_requests(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AccessRequest>, ServiceError> {
        Ok(self
            .requests
            .iter()
            .filter(|r| r.has_lapsed_at(now))
            .map(|r| r.clone())
            .collect())
    }

    async fn find_role_assignment(
        &self,
        assignment_id: Uuid,
    ) -> Result<Option<RoleAssignment>, ServiceError> {
        Ok(self.assignments.get(&assignment_id).map(|a| a.clone()))
    }

    async fn list_role_assignments_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RoleAssignment>, ServiceError> {
        let mut assignments: Vec<RoleAssignment> = self
            .assignments
            .iter()
            .filter(|a| a.user_id == user_id)
            .map(|a| a.clone())
            .collect();
        assignments.sort_by_key(|a| a.created_utc);
        Ok(assignments)
    }

    async fn mark_assignment_synced(&self, assignment_id: Uuid) -> Result<(), ServiceError> {
        let mut assignment = self
            .assignments
            .get_mut(&assignment_id)
            .ok_or_else(|| ServiceError::not_found("Role assignment", assignment_id))?;
        assignment.oracle_synced = true;
        Ok(())
    }

    async fn list_unsynced_assignments(&self) -> Result<Vec<RoleAssignment>, ServiceError> {
        let mut assignments: Vec<RoleAssignment> = self
            .assignments
            .iter()
            .filter(|a| !a.oracle_synced)
            .map(|a| a.clone())
            .collect();
        assignments.sort_by_key(|a| a.created_utc);
        Ok(assignments)
    }

    async fn list_expired_assignments(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoleAssignment>, ServiceError> {
        Ok(self
            .assignments
            .iter()
            .filter(|a| a.has_expired_at(now))
            .map(|a| a.clone())
            .collect())
    }

    async fn delete_role_assignment(
        &self,
        assignment_id: Uuid,
    ) -> Result<Option<RoleAssignment>, ServiceError> {
        Ok(self.assignments.remove(&assignment_id).map(|(_, a)| a))
    }

    async fn append_audit_entry(
        &self,
        record: AuditRecord,
    ) -> Result<AuditLogEntry, ServiceError> {
        if self.audit_unavailable.load(Ordering::SeqCst) {
            return Err(ServiceError::Internal("audit sink unavailable".to_string()));
        }

        let mut log = self.audit.write().await;
        let now = Utc::now();
        let created_utc = match log.last() {
            Some(last) if last.created_utc >= now => last.created_utc + Duration::microseconds(1),
            _ => now,
        };
        let entry = record.into_entry(log.len() as i64 + 1, created_utc);
        log.push(entry.clone());
        Ok(entry)
    }

    async fn query_audit_entries(
        &self,
        query: &AuditQuery,
    ) -> Result<Page<AuditLogEntry>, ServiceError> {
        let log = self.audit.read().await;
        let matching: Vec<AuditLogEntry> = log
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        Ok(Page::from_sorted(matching, query.page, query.per_page))
    }

    async fn distinct_audit_actions(&self) -> Result<Vec<String>, ServiceError> {
        let log = self.audit.read().await;
        let actions: BTreeSet<String> = log.iter().map(|e| e.action.clone()).collect();
        Ok(actions.into_iter().collect())
    }

    async fn distinct_audit_entity_types(&self) -> Result<Vec<String>, ServiceError> {
        let log = self.audit.read().await;
        let types: BTreeSet<String> = log.iter().map(|e| e.entity_type.clone()).collect();
        Ok(types.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AccessRequestStatus, AuditAction, CallerRole, EntityType, NewAccessRequest, RequestType,
    };
    use std::sync::Arc;

    struct Fixture {
        store: MemoryStore,
        owner: Uuid,
        repository: Repository,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let owner = User::new("owner@example.com", None);
        let org = Organization::new("acme");
        let repository = Repository::new(org.organization_id, owner.user_id, "infra");
        store.insert_user(&owner).await.unwrap();
        store.insert_organization(&org).await.unwrap();
        store.insert_repository(&repository).await.unwrap();
        Fixture {
            store,
            owner: owner.user_id,
            repository,
        }
    }

    fn request_for(requester: Uuid, repository_id: Uuid, approvers: Vec<Uuid>) -> AccessRequest {
        NewAccessRequest {
            requester_id: requester,
            repository_id,
            role_id: None,
            requested_actions: vec!["read".to_string()],
            reason: "debugging".to_string(),
            approver_ids: approvers,
            requires_multi_approval: true,
            expires_utc: None,
        }
        .into_pending(Utc::now())
    }

    #[tokio::test]
    async fn second_pending_request_for_pair_conflicts() {
        let f = fixture().await;
        let requester = Uuid::new_v4();
        let first = request_for(requester, f.repository.repository_id, vec![]);
        f.store.insert_access_request(&first).await.unwrap();

        let second = request_for(requester, f.repository.repository_id, vec![]);
        let err = f.store.insert_access_request(&second).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert!(f
            .store
            .find_access_request(second.request_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn closing_a_request_frees_the_pair() {
        let f = fixture().await;
        let requester = Uuid::new_v4();
        let first = request_for(requester, f.repository.repository_id, vec![]);
        f.store.insert_access_request(&first).await.unwrap();
        f.store
            .close_request(
                first.request_id,
                &RequestClosure::Rejected {
                    actor_id: f.owner,
                    reason: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let retry = request_for(requester, f.repository.repository_id, vec![]);
        f.store.insert_access_request(&retry).await.unwrap();
    }

    fn grant_for(request: &AccessRequest) -> RoleAssignment {
        RoleAssignment::for_request(
            request.request_id,
            request.requester_id,
            Uuid::new_v4(),
            request.repository_id,
            None,
        )
    }

    #[tokio::test]
    async fn concurrent_approvals_reach_quorum_once() {
        let f = fixture().await;
        let approvers: Vec<Uuid> = (0..7).map(|_| Uuid::new_v4()).collect();
        let request = request_for(Uuid::new_v4(), f.repository.repository_id, approvers.clone());
        f.store.insert_access_request(&request).await.unwrap();
        let grant = grant_for(&request);

        let store = Arc::new(f.store);
        let mut voters = approvers;
        voters.push(f.owner);

        let handles: Vec<_> = voters
            .into_iter()
            .map(|voter| {
                let store = Arc::clone(&store);
                let grant = grant.clone();
                let id = request.request_id;
                tokio::spawn(async move {
                    store.record_approval(id, voter, Utc::now(), Some(&grant)).await
                })
            })
            .collect();

        let mut reached = 0;
        for handle in handles {
            let (_, tally) = handle.await.unwrap().unwrap();
            if tally.quorum_reached() {
                reached += 1;
            }
        }
        assert_eq!(reached, 1);

        let stored = store
            .find_access_request(request.request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.approval_count, 8);
        assert_eq!(stored.status, AccessRequestStatus::Approved);
        assert_eq!(store.assignment_count(), 1);
    }

    #[tokio::test]
    async fn quorum_step_approves_and_grants_in_one_unit() {
        let f = fixture().await;
        let approver = Uuid::new_v4();
        let request = request_for(Uuid::new_v4(), f.repository.repository_id, vec![approver]);
        f.store.insert_access_request(&request).await.unwrap();
        let grant = grant_for(&request);

        let (first, tally) = f
            .store
            .record_approval(request.request_id, f.owner, Utc::now(), Some(&grant))
            .await
            .unwrap();
        assert!(!tally.quorum_reached());
        assert_eq!(first.status, AccessRequestStatus::Pending);
        assert_eq!(f.store.assignment_count(), 0);

        let (last, tally) = f
            .store
            .record_approval(request.request_id, approver, Utc::now(), Some(&grant))
            .await
            .unwrap();
        assert!(tally.quorum_reached());
        assert_eq!(last.status, AccessRequestStatus::Approved);
        assert_eq!(last.finalized_by, Some(approver));
        assert_eq!(f.store.assignment_count(), 1);

        // The pair is free again as soon as the quorum step returns.
        let next = request_for(request.requester_id, f.repository.repository_id, vec![]);
        f.store.insert_access_request(&next).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pending_index_only_points_at_pending_requests() {
        let f = fixture().await;
        let store = Arc::new(f.store);
        let requester = Uuid::new_v4();

        for _ in 0..200 {
            let request = request_for(requester, f.repository.repository_id, vec![]);
            store.insert_access_request(&request).await.unwrap();

            let closer = {
                let store = Arc::clone(&store);
                let owner = f.owner;
                tokio::spawn(async move {
                    store
                        .close_request(
                            request.request_id,
                            &RequestClosure::Rejected {
                                actor_id: owner,
                                reason: None,
                            },
                            Utc::now(),
                        )
                        .await
                })
            };

            while !closer.is_finished() {
                for slot in store.pending_index.iter() {
                    if let Some(indexed) = store.requests.get(slot.value()) {
                        assert!(indexed.is_pending(), "slot kept for a closed request");
                    }
                }
                tokio::task::yield_now().await;
            }
            closer.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn finalize_inserts_assignment_with_status_change() {
        let f = fixture().await;
        let request = request_for(Uuid::new_v4(), f.repository.repository_id, vec![]);
        f.store.insert_access_request(&request).await.unwrap();
        let grant = RoleAssignment::for_request(
            request.request_id,
            request.requester_id,
            Uuid::new_v4(),
            request.repository_id,
            None,
        );

        let approved = f
            .store
            .finalize_approval(request.request_id, f.owner, Utc::now(), Some(&grant))
            .await
            .unwrap();
        assert_eq!(approved.status, AccessRequestStatus::Approved);
        assert_eq!(f.store.assignment_count(), 1);

        let again = f
            .store
            .finalize_approval(request.request_id, f.owner, Utc::now(), Some(&grant))
            .await;
        assert!(matches!(again, Err(ServiceError::Conflict(_))));
        assert_eq!(f.store.assignment_count(), 1);
    }

    #[tokio::test]
    async fn list_respects_owner_as_implicit_approver() {
        let f = fixture().await;
        let request = request_for(Uuid::new_v4(), f.repository.repository_id, vec![]);
        f.store.insert_access_request(&request).await.unwrap();

        let filter = AccessRequestFilter {
            request_type: RequestType::Pending,
            caller: Some((f.owner, CallerRole::Approver)),
            ..Default::default()
        };
        let page = f.store.list_access_requests(&filter).await.unwrap();
        assert_eq!(page.total, 1);

        let stranger = AccessRequestFilter {
            caller: Some((Uuid::new_v4(), CallerRole::Any)),
            ..Default::default()
        };
        assert_eq!(f.store.list_access_requests(&stranger).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn audit_entries_are_strictly_ordered() {
        let store = MemoryStore::new();
        for i in 0..20 {
            store
                .append_audit_entry(AuditRecord::new(
                    AuditAction::Created,
                    EntityType::AccessRequest,
                    i,
                    "created",
                ))
                .await
                .unwrap();
        }
        let page = store
            .query_audit_entries(&AuditQuery {
                per_page: 100,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 20);
        for pair in page.items.windows(2) {
            assert!(pair[0].sequence > pair[1].sequence);
            assert!(pair[0].created_utc > pair[1].created_utc);
        }
    }

    #[tokio::test]
    async fn audit_outage_surfaces_as_error() {
        let store = MemoryStore::new();
        store.set_audit_available(false);
        let result = store
            .append_audit_entry(AuditRecord::new(
                AuditAction::Created,
                EntityType::AccessRequest,
                "x",
                "created",
            ))
            .await;
        assert!(result.is_err());
        store.set_audit_available(true);
        assert!(store.distinct_audit_actions().await.unwrap().is_empty());
    }
}
