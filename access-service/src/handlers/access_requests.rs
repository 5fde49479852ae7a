//! Access request endpoints: create, list, read, approve and reject.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::context::{reported, CallerId};
use crate::models::{
    AccessRequest, AccessRequestFilter, AccessRequestStatus, CallerRole, ClientContext, Page,
    RequestType,
};
use crate::services::{ApprovalDecision, CreateAccessRequest};
use crate::AppState;
use service_core::error::AppError;

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAccessRequestBody {
    pub repository_id: Uuid,
    pub role_id: Option<Uuid>,
    #[validate(length(min = 1, max = 64))]
    pub actions: Option<Vec<String>>,
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub reason: String,
    #[validate(length(max = 32))]
    pub approver_ids: Option<Vec<Uuid>>,
    pub requires_multi_approval: Option<bool>,
    pub expires_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ListAccessRequestsQuery {
    pub status: Option<AccessRequestStatus>,
    #[serde(rename = "type", default)]
    pub request_type: RequestType,
    /// Perspective of the caller; defaults to both sides.
    #[serde(default)]
    pub role: CallerRole,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApproveBody {
    #[validate(length(min = 1, max = 1024))]
    pub biometric_token: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct RejectBody {
    #[validate(length(max = 2000))]
    pub reason: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /access-requests
#[tracing::instrument(skip(state, context, body), fields(user_id = %caller.0, repository_id = %body.repository_id))]
pub async fn create_access_request(
    State(state): State<AppState>,
    caller: CallerId,
    context: ClientContext,
    Json(body): Json<CreateAccessRequestBody>,
) -> Result<(StatusCode, Json<AccessRequest>), AppError> {
    body.validate()?;

    let input = CreateAccessRequest {
        requester_id: caller.0,
        repository_id: body.repository_id,
        role_id: body.role_id,
        actions: body.actions,
        reason: body.reason,
        approver_ids: body.approver_ids,
        requires_multi_approval: body.requires_multi_approval,
        expires_utc: body.expires_utc,
    };
    let result = state.workflow.registry.create(input, &context).await;
    let request = reported(&state, "create_access_request", Some(caller.0), &context, result).await?;

    Ok((StatusCode::CREATED, Json(request)))
}

/// GET /access-requests
///
/// Only requests the caller participates in are listed.
#[tracing::instrument(skip(state, context), fields(user_id = %caller.0))]
pub async fn list_access_requests(
    State(state): State<AppState>,
    caller: CallerId,
    context: ClientContext,
    Query(query): Query<ListAccessRequestsQuery>,
) -> Result<Json<Page<AccessRequest>>, AppError> {
    let filter = AccessRequestFilter {
        status: query.status,
        request_type: query.request_type,
        caller: Some((caller.0, query.role)),
        page: query.page,
        per_page: query.per_page,
    };
    let result = state.workflow.registry.list(&filter).await;
    let page = reported(&state, "list_access_requests", Some(caller.0), &context, result).await?;
    Ok(Json(page))
}

/// GET /access-requests/:id
#[tracing::instrument(skip(state, context), fields(user_id = %caller.0))]
pub async fn get_access_request(
    State(state): State<AppState>,
    caller: CallerId,
    context: ClientContext,
    Path(request_id): Path<Uuid>,
) -> Result<Json<AccessRequest>, AppError> {
    let result = state.workflow.registry.get_for(request_id, caller.0).await;
    let request = reported(&state, "get_access_request", Some(caller.0), &context, result).await?;
    Ok(Json(request))
}

/// POST /access-requests/:id/approve
#[tracing::instrument(skip(state, context, body), fields(user_id = %caller.0))]
pub async fn approve_access_request(
    State(state): State<AppState>,
    caller: CallerId,
    context: ClientContext,
    Path(request_id): Path<Uuid>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<ApprovalDecision>, AppError> {
    body.validate()?;

    let result = state
        .workflow
        .coordinator
        .approve(request_id, caller.0, &body.biometric_token, &context)
        .await;
    let decision = reported(&state, "approve_access_request", Some(caller.0), &context, result).await?;
    Ok(Json(decision))
}

/// POST /access-requests/:id/reject
#[tracing::instrument(skip(state, context, body), fields(user_id = %caller.0))]
pub async fn reject_access_request(
    State(state): State<AppState>,
    caller: CallerId,
    context: ClientContext,
    Path(request_id): Path<Uuid>,
    body: Option<Json<RejectBody>>,
) -> Result<Json<AccessRequest>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    body.validate()?;

    let result = state
        .workflow
        .coordinator
        .reject(request_id, caller.0, body.reason, &context)
        .await;
    let request = reported(&state, "reject_access_request", Some(caller.0), &context, result).await?;
    Ok(Json(request))
}
