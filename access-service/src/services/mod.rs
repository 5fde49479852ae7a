//! Services layer for access-service.
//!
//! Components receive their persistence handle and collaborators through
//! their constructors; [`AccessWorkflow`] wires one consistent set.

pub mod assignments;
pub mod audit;
pub mod biometric;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod notification;
pub mod oracle;
pub mod outcome;
pub mod registry;
pub mod store;

pub use assignments::{CatalogReport, FinalizeOutcome, ResyncReport, RevokeOutcome, RoleAssignmentManager};
pub use audit::AuditRecorder;
pub use biometric::{BiometricVerifier, HmacBiometricVerifier, MockBiometricVerifier, MockVerdict};
pub use coordinator::{ApprovalCoordinator, ApprovalDecision};
pub use error::ServiceError;
pub use notification::{LogNotifier, MockNotifier, Notification, NotificationDispatcher, Notifier, WebhookNotifier};
pub use oracle::{AuthorizationOracle, LocalOracle, OracleClient, RemoteOracle, RetryPolicy};
pub use outcome::SideEffect;
pub use registry::{AccessRequestRegistry, CreateAccessRequest};
pub use store::{AccessStore, MemoryStore, PgStore};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{AuditLogEntry, AuditQuery, EntityType, Page};

/// The four core components over one store.
#[derive(Clone)]
pub struct AccessWorkflow {
    pub store: Arc<dyn AccessStore>,
    pub audit: AuditRecorder,
    pub registry: AccessRequestRegistry,
    pub coordinator: ApprovalCoordinator,
    pub assignments: RoleAssignmentManager,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub expired_requests: usize,
    pub purged_assignments: usize,
    pub resync: ResyncReport,
}

impl AccessWorkflow {
    pub fn new(
        store: Arc<dyn AccessStore>,
        oracle: OracleClient,
        verifier: Arc<dyn BiometricVerifier>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let audit = AuditRecorder::new(store.clone());
        let notifications = NotificationDispatcher::new(notifier);
        let registry =
            AccessRequestRegistry::new(store.clone(), audit.clone(), notifications.clone());
        let assignments = RoleAssignmentManager::new(
            store.clone(),
            oracle,
            audit.clone(),
            notifications.clone(),
        );
        let coordinator = ApprovalCoordinator::new(
            store.clone(),
            assignments.clone(),
            verifier,
            audit.clone(),
            notifications,
        );

        Self {
            store,
            audit,
            registry,
            coordinator,
            assignments,
        }
    }

    /// Audit entries `viewer_id` may read.
    ///
    /// Naming an access request (`entity_id`, with `entity_type` absent or
    /// `access_request`) reads that request's full history, provided the
    /// viewer participates in it. Any other query is narrowed to the viewer's
    /// own actions.
    pub async fn audit_for(
        &self,
        viewer_id: Uuid,
        mut query: AuditQuery,
    ) -> Result<Page<AuditLogEntry>, ServiceError> {
        let request_type = EntityType::AccessRequest.as_str();
        let names_request = query
            .entity_type
            .as_deref()
            .is_none_or(|t| t == request_type);
        let request_id = query
            .entity_id
            .as_deref()
            .filter(|_| names_request)
            .and_then(|id| Uuid::parse_str(id).ok());

        match request_id {
            Some(request_id) => {
                self.registry.get_for(request_id, viewer_id).await?;
                query.entity_type = Some(request_type.to_string());
            }
            None => {
                if query.actor_id.is_some_and(|actor| actor != viewer_id) {
                    return Err(ServiceError::Authorization(
                        "Other actors' entries are readable only through a shared request".to_string(),
                    ));
                }
                query.actor_id = Some(viewer_id);
            }
        }
        self.audit.query(&query).await
    }

    /// Expire lapsed requests, purge lapsed grants and retry unsynced
    /// bindings. Meant for a scheduler.
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, ServiceError> {
        let expired = self.registry.expire_stale(now).await?;
        let purged = self.assignments.purge_expired(now).await?;
        let resync = self.assignments.resync_pending().await?;
        Ok(MaintenanceReport {
            expired_requests: expired.len(),
            purged_assignments: purged.len(),
            resync,
        })
    }
}
