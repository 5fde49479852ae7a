//! Audit log model - append-only record of every state-changing action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Created,
    ApprovalStep,
    Approved,
    Rejected,
    Expired,
    OracleSyncFailed,
    OracleResynced,
    RoleRevoked,
    RoleExpired,
    ServerError,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "CREATED",
            AuditAction::ApprovalStep => "APPROVAL_STEP",
            AuditAction::Approved => "APPROVED",
            AuditAction::Rejected => "REJECTED",
            AuditAction::Expired => "EXPIRED",
            AuditAction::OracleSyncFailed => "ORACLE_SYNC_FAILED",
            AuditAction::OracleResynced => "ORACLE_RESYNCED",
            AuditAction::RoleRevoked => "ROLE_REVOKED",
            AuditAction::RoleExpired => "ROLE_EXPIRED",
            AuditAction::ServerError => "SERVER_ERROR",
        }
    }
}

/// Audited entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    AccessRequest,
    RoleAssignment,
    HttpRequest,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::AccessRequest => "access_request",
            EntityType::RoleAssignment => "role_assignment",
            EntityType::HttpRequest => "http_request",
        }
    }
}

/// Network/client context captured at the HTTP edge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
}

impl ClientContext {
    /// Context for actions with no client behind them (sweeps, backfills).
    pub fn system() -> Self {
        Self::default()
    }
}

/// An entry to be appended. The store assigns id, sequence and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub action: AuditAction,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub actor_id: Option<Uuid>,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    pub context: ClientContext,
}

impl AuditRecord {
    pub fn new(
        action: AuditAction,
        entity_type: EntityType,
        entity_id: impl ToString,
        description: impl Into<String>,
    ) -> Self {
        Self {
            action,
            entity_type,
            entity_id: entity_id.to_string(),
            actor_id: None,
            description: description.into(),
            metadata: None,
            context: ClientContext::default(),
        }
    }

    pub fn actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn context(mut self, context: &ClientContext) -> Self {
        self.context = context.clone();
        self
    }

    /// Materialize the stored entry.
    pub fn into_entry(self, sequence: i64, created_utc: DateTime<Utc>) -> AuditLogEntry {
        AuditLogEntry {
            entry_id: Uuid::new_v4(),
            sequence,
            action: self.action.as_str().to_string(),
            entity_type: self.entity_type.as_str().to_string(),
            entity_id: self.entity_id,
            actor_id: self.actor_id,
            description: self.description,
            metadata: self.metadata,
            ip_address: self.context.ip_address,
            user_agent: self.context.user_agent,
            request_id: self.context.request_id,
            created_utc,
        }
    }
}

/// Stored audit log entry. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub entry_id: Uuid,
    /// Strictly increasing append position.
    pub sequence: i64,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor_id: Option<Uuid>,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Filterable, paginated range read over the audit trail.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub actor_id: Option<Uuid>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub action: Option<String>,
    pub from_utc: Option<DateTime<Utc>>,
    pub to_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
}

impl AuditQuery {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.actor_id.is_none_or(|id| entry.actor_id == Some(id))
            && self
                .entity_type
                .as_deref()
                .is_none_or(|t| entry.entity_type == t)
            && self.entity_id.as_deref().is_none_or(|id| entry.entity_id == id)
            && self.action.as_deref().is_none_or(|a| entry.action == a)
            && self.from_utc.is_none_or(|from| entry.created_utc >= from)
            && self.to_utc.is_none_or(|to| entry.created_utc <= to)
    }
}
