//! Audit trail read endpoints.

use axum::extract::{Json, Query, State};
use serde::Serialize;

use super::context::{reported, CallerId};
use crate::models::{AuditLogEntry, AuditQuery, ClientContext, Page};
use crate::AppState;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
pub struct DistinctValuesResponse {
    pub values: Vec<String>,
}

/// GET /audit-logs
///
/// Scoped to the caller: the history of a request they take part in, or
/// their own actions.
#[tracing::instrument(
    skip(state, context, query),
    fields(
        user_id = %caller.0,
        action = ?query.action,
        entity_type = ?query.entity_type,
        page = query.page,
        per_page = query.per_page
    )
)]
pub async fn list_audit_logs(
    State(state): State<AppState>,
    caller: CallerId,
    context: ClientContext,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Page<AuditLogEntry>>, AppError> {
    let result = state.workflow.audit_for(caller.0, query).await;
    let page = reported(&state, "list_audit_logs", Some(caller.0), &context, result).await?;
    Ok(Json(page))
}

/// GET /audit-logs/actions
pub async fn list_audit_actions(
    State(state): State<AppState>,
    caller: CallerId,
    context: ClientContext,
) -> Result<Json<DistinctValuesResponse>, AppError> {
    let result = state.workflow.audit.distinct_actions().await;
    let values = reported(&state, "list_audit_actions", Some(caller.0), &context, result).await?;
    Ok(Json(DistinctValuesResponse { values }))
}

/// GET /audit-logs/entity-types
pub async fn list_audit_entity_types(
    State(state): State<AppState>,
    caller: CallerId,
    context: ClientContext,
) -> Result<Json<DistinctValuesResponse>, AppError> {
    let result = state.workflow.audit.distinct_entity_types().await;
    let values = reported(&state, "list_audit_entity_types", Some(caller.0), &context, result).await?;
    Ok(Json(DistinctValuesResponse { values }))
}
