//! Audit trail recorder.
//!
//! Appends are best-effort from the caller's point of view: a failed write is
//! logged and counted, then reported as a [`SideEffect`], never as an error.

use std::sync::Arc;
use tracing::{error, instrument};

use super::metrics::{AUDIT_APPENDS_TOTAL, ERRORS_TOTAL};
use super::outcome::SideEffect;
use super::store::AccessStore;
use super::ServiceError;
use crate::models::{AuditLogEntry, AuditQuery, AuditRecord, Page};

#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AccessStore>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AccessStore>) -> Self {
        Self { store }
    }

    /// Append one entry. Never fails the triggering operation.
    #[instrument(skip(self, record), fields(action = record.action.as_str(), entity_id = %record.entity_id))]
    pub async fn append(&self, record: AuditRecord) -> SideEffect {
        let action = record.action;
        let entity_type = record.entity_type;
        let entity_id = record.entity_id.clone();

        match self.store.append_audit_entry(record).await {
            Ok(_) => {
                AUDIT_APPENDS_TOTAL.with_label_values(&["ok"]).inc();
                SideEffect::Succeeded
            }
            Err(e) => {
                AUDIT_APPENDS_TOTAL.with_label_values(&["error"]).inc();
                ERRORS_TOTAL.with_label_values(&["audit_write"]).inc();
                error!(
                    error = %e,
                    action = action.as_str(),
                    entity_type = entity_type.as_str(),
                    entity_id = %entity_id,
                    "Failed to write audit log entry"
                );
                SideEffect::failed(e)
            }
        }
    }

    /// Filtered range read, most recent first.
    pub async fn query(&self, query: &AuditQuery) -> Result<Page<AuditLogEntry>, ServiceError> {
        if let (Some(from), Some(to)) = (query.from_utc, query.to_utc) {
            if from > to {
                return Err(ServiceError::Validation(
                    "from_utc must not be after to_utc".to_string(),
                ));
            }
        }
        self.store.query_audit_entries(query).await
    }

    /// Every audit entry referencing one entity, oldest first.
    pub async fn history(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditLogEntry>, ServiceError> {
        let query = AuditQuery {
            entity_type: Some(entity_type.to_string()),
            entity_id: Some(entity_id.to_string()),
            per_page: crate::models::MAX_PAGE_SIZE,
            ..Default::default()
        };
        let mut entries = self.store.query_audit_entries(&query).await?.items;
        entries.reverse();
        Ok(entries)
    }

    pub async fn distinct_actions(&self) -> Result<Vec<String>, ServiceError> {
        self.store.distinct_audit_actions().await
    }

    pub async fn distinct_entity_types(&self) -> Result<Vec<String>, ServiceError> {
        self.store.distinct_audit_entity_types().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditAction, EntityType};
    use crate::services::store::MemoryStore;
    use chrono::{Duration, Utc};

    fn record(action: AuditAction, id: &str) -> AuditRecord {
        AuditRecord::new(action, EntityType::AccessRequest, id, "test")
    }

    #[tokio::test]
    async fn failed_writes_are_reported_not_raised() {
        let store = Arc::new(MemoryStore::new());
        let recorder = AuditRecorder::new(store.clone());

        store.set_audit_available(false);
        let outcome = recorder.append(record(AuditAction::Created, "a")).await;
        assert!(outcome.is_failed());

        store.set_audit_available(true);
        let outcome = recorder.append(record(AuditAction::Created, "a")).await;
        assert_eq!(outcome, SideEffect::Succeeded);
        assert_eq!(recorder.history("access_request", "a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_is_oldest_first() {
        let recorder = AuditRecorder::new(Arc::new(MemoryStore::new()));
        recorder.append(record(AuditAction::Created, "r")).await;
        recorder.append(record(AuditAction::ApprovalStep, "r")).await;
        recorder.append(record(AuditAction::Created, "other")).await;
        recorder.append(record(AuditAction::Approved, "r")).await;

        let actions: Vec<String> = recorder
            .history("access_request", "r")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["CREATED", "APPROVAL_STEP", "APPROVED"]);
    }

    #[tokio::test]
    async fn inverted_date_range_is_rejected() {
        let recorder = AuditRecorder::new(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        let query = AuditQuery {
            from_utc: Some(now),
            to_utc: Some(now - Duration::hours(1)),
            ..Default::default()
        };
        assert!(matches!(
            recorder.query(&query).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn distinct_vocabularies_are_sorted() {
        let recorder = AuditRecorder::new(Arc::new(MemoryStore::new()));
        recorder.append(record(AuditAction::Rejected, "x")).await;
        recorder.append(record(AuditAction::Created, "x")).await;
        recorder.append(record(AuditAction::Created, "y")).await;

        assert_eq!(
            recorder.distinct_actions().await.unwrap(),
            vec!["CREATED", "REJECTED"]
        );
        assert_eq!(
            recorder.distinct_entity_types().await.unwrap(),
            vec!["access_request"]
        );
    }
}
