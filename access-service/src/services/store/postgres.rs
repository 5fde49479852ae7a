//! PostgreSQL implementation of [`AccessStore`].
//!
//! Request mutations run as `SELECT ... FOR UPDATE` + conditional `UPDATE`
//! inside one transaction, so concurrent approvals of the same request
//! serialize on its row while other requests proceed untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{FromRow, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::AccessStore;
use crate::models::{
    normalize_page, page_offset, AccessRequest, AccessRequestFilter, AccessRequestStatus,
    ApprovalTally, AuditLogEntry, AuditQuery, AuditRecord, Organization, Page, Repository,
    RequestClosure, Role, RoleAssignment, User,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::ServiceError;

/// Advisory lock key serializing audit appends.
const AUDIT_APPEND_LOCK: i64 = 0x4155_4449_5400;

const REQUEST_COLUMNS: &str = "ar.request_id, ar.requester_id, ar.repository_id, ar.role_id, \
    ar.requested_actions, ar.reason, ar.status, ar.approver_ids, ar.requires_multi_approval, \
    ar.approval_count, ar.approved_by, ar.finalized_by, ar.finalized_utc, ar.rejection_reason, \
    ar.expires_utc, ar.created_utc, ar.updated_utc";

const REQUEST_FILTER: &str = "($1::text IS NULL OR ar.status = $1) \
    AND ($2::text IS NULL OR ar.status = $2) \
    AND ($3::uuid IS NULL \
        OR ($4::text IN ('requester', 'any') AND ar.requester_id = $3) \
        OR ($4::text IN ('approver', 'any') AND (ar.finalized_by = $3 \
            OR $3 = ANY(ar.approver_ids) \
            OR (ar.status = 'pending' AND r.owner_id = $3))))";

const AUDIT_FILTER: &str = "($1::uuid IS NULL OR actor_id = $1) \
    AND ($2::text IS NULL OR entity_type = $2) \
    AND ($3::text IS NULL OR entity_id = $3) \
    AND ($4::text IS NULL OR action = $4) \
    AND ($5::timestamptz IS NULL OR created_utc >= $5) \
    AND ($6::timestamptz IS NULL OR created_utc <= $6)";

#[derive(FromRow)]
struct UserRow {
    user_id: Uuid,
    email: String,
    display_name: Option<String>,
    biometric_enabled: bool,
    created_utc: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            user_id: row.user_id,
            email: row.email,
            display_name: row.display_name,
            biometric_enabled: row.biometric_enabled,
            created_utc: row.created_utc,
        }
    }
}

#[derive(FromRow)]
struct RepositoryRow {
    repository_id: Uuid,
    organization_id: Uuid,
    owner_id: Uuid,
    name: String,
    created_utc: DateTime<Utc>,
}

impl From<RepositoryRow> for Repository {
    fn from(row: RepositoryRow) -> Self {
        Repository {
            repository_id: row.repository_id,
            organization_id: row.organization_id,
            owner_id: row.owner_id,
            name: row.name,
            created_utc: row.created_utc,
        }
    }
}

#[derive(FromRow)]
struct RoleRow {
    role_id: Uuid,
    organization_id: Uuid,
    role_key: String,
    role_label: String,
    actions: Vec<String>,
    created_utc: DateTime<Utc>,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Role {
            role_id: row.role_id,
            organization_id: row.organization_id,
            role_key: row.role_key,
            role_label: row.role_label,
            actions: row.actions,
            created_utc: row.created_utc,
        }
    }
}

#[derive(FromRow)]
struct AccessRequestRow {
    request_id: Uuid,
    requester_id: Uuid,
    repository_id: Uuid,
    role_id: Option<Uuid>,
    requested_actions: Vec<String>,
    reason: String,
    status: String,
    approver_ids: Vec<Uuid>,
    requires_multi_approval: bool,
    approval_count: i32,
    approved_by: Vec<Uuid>,
    finalized_by: Option<Uuid>,
    finalized_utc: Option<DateTime<Utc>>,
    rejection_reason: Option<String>,
    expires_utc: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<AccessRequestRow> for AccessRequest {
    type Error = ServiceError;

    fn try_from(row: AccessRequestRow) -> Result<Self, Self::Error> {
        let status: AccessRequestStatus = row.status.parse().map_err(ServiceError::Internal)?;
        Ok(AccessRequest {
            request_id: row.request_id,
            requester_id: row.requester_id,
            repository_id: row.repository_id,
            role_id: row.role_id,
            requested_actions: row.requested_actions,
            reason: row.reason,
            status,
            approver_ids: row.approver_ids,
            requires_multi_approval: row.requires_multi_approval,
            approval_count: row.approval_count.max(0) as u32,
            approved_by: row.approved_by,
            finalized_by: row.finalized_by,
            finalized_utc: row.finalized_utc,
            rejection_reason: row.rejection_reason,
            expires_utc: row.expires_utc,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct RoleAssignmentRow {
    assignment_id: Uuid,
    user_id: Uuid,
    role_id: Uuid,
    repository_id: Uuid,
    request_id: Option<Uuid>,
    expires_utc: Option<DateTime<Utc>>,
    oracle_synced: bool,
    created_utc: DateTime<Utc>,
}

impl From<RoleAssignmentRow> for RoleAssignment {
    fn from(row: RoleAssignmentRow) -> Self {
        RoleAssignment {
            assignment_id: row.assignment_id,
            user_id: row.user_id,
            role_id: row.role_id,
            repository_id: row.repository_id,
            request_id: row.request_id,
            expires_utc: row.expires_utc,
            oracle_synced: row.oracle_synced,
            created_utc: row.created_utc,
        }
    }
}

#[derive(FromRow)]
struct AuditLogRow {
    entry_id: Uuid,
    sequence: i64,
    action: String,
    entity_type: String,
    entity_id: String,
    actor_id: Option<Uuid>,
    description: String,
    metadata: Option<serde_json::Value>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    request_id: Option<String>,
    created_utc: DateTime<Utc>,
}

impl From<AuditLogRow> for AuditLogEntry {
    fn from(row: AuditLogRow) -> Self {
        AuditLogEntry {
            entry_id: row.entry_id,
            sequence: row.sequence,
            action: row.action,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            actor_id: row.actor_id,
            description: row.description,
            metadata: row.metadata,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            request_id: row.request_id,
            created_utc: row.created_utc,
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn conflict_or_db(err: sqlx::Error, message: impl FnOnce() -> String) -> ServiceError {
    if is_unique_violation(&err) {
        ServiceError::Conflict(message())
    } else {
        ServiceError::Database(err)
    }
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_request(
        tx: &mut Transaction<'_, Postgres>,
        request_id: Uuid,
    ) -> Result<AccessRequest, ServiceError> {
        let sql = format!(
            "SELECT {} FROM access_requests ar WHERE ar.request_id = $1 FOR UPDATE",
            REQUEST_COLUMNS
        );
        let row = sqlx::query_as::<_, AccessRequestRow>(&sql)
            .bind(request_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| ServiceError::not_found("Access request", request_id))?;
        row.try_into()
    }

    async fn write_request_state(
        tx: &mut Transaction<'_, Postgres>,
        request: &AccessRequest,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE access_requests
            SET status = $2, approval_count = $3, approved_by = $4, finalized_by = $5,
                finalized_utc = $6, rejection_reason = $7, updated_utc = $8
            WHERE request_id = $1 AND status = 'pending'
            "#,
        )
        .bind(request.request_id)
        .bind(request.status.as_str())
        .bind(request.approval_count as i32)
        .bind(&request.approved_by)
        .bind(request.finalized_by)
        .bind(request.finalized_utc)
        .bind(&request.rejection_reason)
        .bind(request.updated_utc)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(ServiceError::Conflict(format!(
                "Access request {} is no longer pending",
                request.request_id
            )));
        }
        Ok(())
    }

    async fn insert_assignment(
        tx: &mut Transaction<'_, Postgres>,
        assignment: &RoleAssignment,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO role_assignments (
                assignment_id, user_id, role_id, repository_id, request_id,
                expires_utc, oracle_synced, created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(assignment.assignment_id)
        .bind(assignment.user_id)
        .bind(assignment.role_id)
        .bind(assignment.repository_id)
        .bind(assignment.request_id)
        .bind(assignment.expires_utc)
        .bind(assignment.oracle_synced)
        .bind(assignment.created_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            conflict_or_db(e, || {
                format!(
                    "Role assignment {} conflicts with an existing grant",
                    assignment.assignment_id
                )
            })
        })?;
        Ok(())
    }
}

#[async_trait]
impl AccessStore for PgStore {
    async fn health_check(&self) -> Result<(), ServiceError> {
        crate::db::health_check(&self.pool).await?;
        Ok(())
    }

    // ==================== Catalog ====================

    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    async fn insert_user(&self, user: &User) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, email, display_name, biometric_enabled, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.biometric_enabled)
        .bind(user.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or_db(e, || format!("User {} already exists", user.email)))?;
        Ok(())
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT user_id, email, display_name, biometric_enabled, created_utc FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn insert_organization(&self, organization: &Organization) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO organizations (organization_id, name, created_utc) VALUES ($1, $2, $3)",
        )
        .bind(organization.organization_id)
        .bind(&organization.name)
        .bind(organization.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_or_db(e, || {
                format!("Organization '{}' already exists", organization.name)
            })
        })?;
        Ok(())
    }

    async fn insert_repository(&self, repository: &Repository) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO repositories (repository_id, organization_id, owner_id, name, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(repository.repository_id)
        .bind(repository.organization_id)
        .bind(repository.owner_id)
        .bind(&repository.name)
        .bind(repository.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_or_db(e, || format!("Repository '{}' already exists", repository.name))
        })?;
        Ok(())
    }

    async fn find_repository(
        &self,
        repository_id: Uuid,
    ) -> Result<Option<Repository>, ServiceError> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            SELECT repository_id, organization_id, owner_id, name, created_utc
            FROM repositories WHERE repository_id = $1
            "#,
        )
        .bind(repository_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Repository::from))
    }

    async fn list_repositories(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<Repository>, ServiceError> {
        let rows = sqlx::query_as::<_, RepositoryRow>(
            r#"
            SELECT repository_id, organization_id, owner_id, name, created_utc
            FROM repositories WHERE organization_id = $1 ORDER BY name
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Repository::from).collect())
    }

    async fn insert_role(&self, role: &Role) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO roles (role_id, organization_id, role_key, role_label, actions, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(role.role_id)
        .bind(role.organization_id)
        .bind(&role.role_key)
        .bind(&role.role_label)
        .bind(&role.actions)
        .bind(role.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or_db(e, || format!("Role '{}' already exists", role.role_key)))?;
        Ok(())
    }

    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, ServiceError> {
        let row = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT role_id, organization_id, role_key, role_label, actions, created_utc
            FROM roles WHERE role_id = $1
            "#,
        )
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Role::from))
    }

    async fn list_roles(&self, organization_id: Uuid) -> Result<Vec<Role>, ServiceError> {
        let rows = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT role_id, organization_id, role_key, role_label, actions, created_utc
            FROM roles WHERE organization_id = $1 ORDER BY role_key
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Role::from).collect())
    }

    // ==================== Access Requests ====================

    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    async fn insert_access_request(&self, request: &AccessRequest) -> Result<(), ServiceError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["insert_access_request"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO access_requests (
                request_id, requester_id, repository_id, role_id, requested_actions, reason,
                status, approver_ids, requires_multi_approval, approval_count, approved_by,
                expires_utc, created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(request.request_id)
        .bind(request.requester_id)
        .bind(request.repository_id)
        .bind(request.role_id)
        .bind(&request.requested_actions)
        .bind(&request.reason)
        .bind(request.status.as_str())
        .bind(&request.approver_ids)
        .bind(request.requires_multi_approval)
        .bind(request.approval_count as i32)
        .bind(&request.approved_by)
        .bind(request.expires_utc)
        .bind(request.created_utc)
        .bind(request.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_or_db(e, || {
                "A pending access request already exists for this repository".to_string()
            })
        })?;
        Ok(())
    }

    async fn find_access_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<AccessRequest>, ServiceError> {
        let sql = format!(
            "SELECT {} FROM access_requests ar WHERE ar.request_id = $1",
            REQUEST_COLUMNS
        );
        sqlx::query_as::<_, AccessRequestRow>(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?
            .map(AccessRequest::try_from)
            .transpose()
    }

    async fn list_access_requests(
        &self,
        filter: &AccessRequestFilter,
    ) -> Result<Page<AccessRequest>, ServiceError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["list_access_requests"])
            .start_timer();

        let (page, per_page) = normalize_page(filter.page, filter.per_page);
        let status = filter.status.map(|s| s.as_str());
        let type_status = filter.request_type.status().map(|s| s.as_str());
        let caller = filter.caller.map(|(id, _)| id);
        let caller_role = filter.caller.map(|(_, role)| role.as_str());

        let from = "FROM access_requests ar JOIN repositories r ON r.repository_id = ar.repository_id";

        let count_sql = format!("SELECT COUNT(*) {} WHERE {}", from, REQUEST_FILTER);
        let (total,): (i64,) = sqlx::query_as(&count_sql)
            .bind(status)
            .bind(type_status)
            .bind(caller)
            .bind(caller_role)
            .fetch_one(&self.pool)
            .await?;

        let data_sql = format!(
            "SELECT {} {} WHERE {} ORDER BY ar.created_utc DESC, ar.request_id LIMIT $5 OFFSET $6",
            REQUEST_COLUMNS, from, REQUEST_FILTER
        );
        let rows = sqlx::query_as::<_, AccessRequestRow>(&data_sql)
            .bind(status)
            .bind(type_status)
            .bind(caller)
            .bind(caller_role)
            .bind(i64::from(per_page))
            .bind(page_offset(page, per_page) as i64)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(AccessRequest::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page,
            per_page,
        })
    }

    #[instrument(skip(self, assignment), fields(request_id = %request_id, approver_id = %approver_id))]
    async fn record_approval(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
        at: DateTime<Utc>,
        assignment: Option<&RoleAssignment>,
    ) -> Result<(AccessRequest, ApprovalTally), ServiceError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["record_approval"])
            .start_timer();

        let mut tx = self.pool.begin().await?;
        let mut request = Self::lock_request(&mut tx, request_id).await?;
        let tally = request.register_approval(approver_id, at)?;
        let finalizing = tally.quorum_reached();
        if finalizing {
            request.finalize(approver_id, at)?;
        }
        Self::write_request_state(&mut tx, &request).await?;
        if let Some(assignment) = assignment.filter(|_| finalizing) {
            Self::insert_assignment(&mut tx, assignment).await?;
        }
        tx.commit().await?;

        Ok((request, tally))
    }

    #[instrument(skip(self, assignment), fields(request_id = %request_id, approver_id = %approver_id))]
    async fn finalize_approval(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
        at: DateTime<Utc>,
        assignment: Option<&RoleAssignment>,
    ) -> Result<AccessRequest, ServiceError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["finalize_approval"])
            .start_timer();

        let mut tx = self.pool.begin().await?;
        let mut request = Self::lock_request(&mut tx, request_id).await?;
        request.finalize(approver_id, at)?;
        Self::write_request_state(&mut tx, &request).await?;

        if let Some(assignment) = assignment {
            Self::insert_assignment(&mut tx, assignment).await?;
        }

        tx.commit().await?;
        Ok(request)
    }

    #[instrument(skip(self, closure), fields(request_id = %request_id, status = %closure.status()))]
    async fn close_request(
        &self,
        request_id: Uuid,
        closure: &RequestClosure,
        at: DateTime<Utc>,
    ) -> Result<AccessRequest, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let mut request = Self::lock_request(&mut tx, request_id).await?;
        request.close(closure, at)?;
        Self::write_request_state(&mut tx, &request).await?;
        tx.commit().await?;
        Ok(request)
    }

    async fn find_lapsed_requests(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AccessRequest>, ServiceError> {
        let sql = format!(
            "SELECT {} FROM access_requests ar \
             WHERE ar.status = 'pending' AND ar.expires_utc <= $1 ORDER BY ar.expires_utc",
            REQUEST_COLUMNS
        );
        sqlx::query_as::<_, AccessRequestRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(AccessRequest::try_from)
            .collect()
    }

    // ==================== Role Assignments ====================

    async fn find_role_assignment(
        &self,
        assignment_id: Uuid,
    ) -> Result<Option<RoleAssignment>, ServiceError> {
        let row = sqlx::query_as::<_, RoleAssignmentRow>(
            "SELECT * FROM role_assignments WHERE assignment_id = $1",
        )
        .bind(assignment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RoleAssignment::from))
    }

    async fn list_role_assignments_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RoleAssignment>, ServiceError> {
        let rows = sqlx::query_as::<_, RoleAssignmentRow>(
            "SELECT * FROM role_assignments WHERE user_id = $1 ORDER BY created_utc",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RoleAssignment::from).collect())
    }

    async fn mark_assignment_synced(&self, assignment_id: Uuid) -> Result<(), ServiceError> {
        let result =
            sqlx::query("UPDATE role_assignments SET oracle_synced = TRUE WHERE assignment_id = $1")
                .bind(assignment_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found("Role assignment", assignment_id));
        }
        Ok(())
    }

    async fn list_unsynced_assignments(&self) -> Result<Vec<RoleAssignment>, ServiceError> {
        let rows = sqlx::query_as::<_, RoleAssignmentRow>(
            "SELECT * FROM role_assignments WHERE NOT oracle_synced ORDER BY created_utc",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RoleAssignment::from).collect())
    }

    async fn list_expired_assignments(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoleAssignment>, ServiceError> {
        let rows = sqlx::query_as::<_, RoleAssignmentRow>(
            "SELECT * FROM role_assignments WHERE expires_utc <= $1 ORDER BY expires_utc",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RoleAssignment::from).collect())
    }

    async fn delete_role_assignment(
        &self,
        assignment_id: Uuid,
    ) -> Result<Option<RoleAssignment>, ServiceError> {
        let row = sqlx::query_as::<_, RoleAssignmentRow>(
            "DELETE FROM role_assignments WHERE assignment_id = $1 RETURNING *",
        )
        .bind(assignment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RoleAssignment::from))
    }

    // ==================== Audit Trail ====================

    async fn append_audit_entry(
        &self,
        record: AuditRecord,
    ) -> Result<AuditLogEntry, ServiceError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["append_audit_entry"])
            .start_timer();

        let mut tx = self.pool.begin().await?;
        // Serialize appends so sequence order and timestamp order agree.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(AUDIT_APPEND_LOCK)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, AuditLogRow>(
            r#"
            INSERT INTO audit_log (
                entry_id, action, entity_type, entity_id, actor_id, description,
                metadata, ip_address, user_agent, request_id, created_utc
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                GREATEST(
                    clock_timestamp(),
                    (SELECT MAX(created_utc) + INTERVAL '1 microsecond' FROM audit_log)
                )
            )
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.action.as_str())
        .bind(record.entity_type.as_str())
        .bind(&record.entity_id)
        .bind(record.actor_id)
        .bind(&record.description)
        .bind(&record.metadata)
        .bind(&record.context.ip_address)
        .bind(&record.context.user_agent)
        .bind(&record.context.request_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn query_audit_entries(
        &self,
        query: &AuditQuery,
    ) -> Result<Page<AuditLogEntry>, ServiceError> {
        let (page, per_page) = normalize_page(query.page, query.per_page);

        let count_sql = format!("SELECT COUNT(*) FROM audit_log WHERE {}", AUDIT_FILTER);
        let (total,): (i64,) = sqlx::query_as(&count_sql)
            .bind(query.actor_id)
            .bind(&query.entity_type)
            .bind(&query.entity_id)
            .bind(&query.action)
            .bind(query.from_utc)
            .bind(query.to_utc)
            .fetch_one(&self.pool)
            .await?;

        let data_sql = format!(
            "SELECT * FROM audit_log WHERE {} ORDER BY sequence DESC LIMIT $7 OFFSET $8",
            AUDIT_FILTER
        );
        let rows = sqlx::query_as::<_, AuditLogRow>(&data_sql)
            .bind(query.actor_id)
            .bind(&query.entity_type)
            .bind(&query.entity_id)
            .bind(&query.action)
            .bind(query.from_utc)
            .bind(query.to_utc)
            .bind(i64::from(per_page))
            .bind(page_offset(page, per_page) as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            items: rows.into_iter().map(AuditLogEntry::from).collect(),
            total: total.max(0) as u64,
            page,
            per_page,
        })
    }

    async fn distinct_audit_actions(&self) -> Result<Vec<String>, ServiceError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT action FROM audit_log ORDER BY action")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(action,)| action).collect())
    }

    async fn distinct_audit_entity_types(&self) -> Result<Vec<String>, ServiceError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT entity_type FROM audit_log ORDER BY entity_type")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(entity_type,)| entity_type).collect())
    }
}
