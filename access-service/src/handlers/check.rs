use axum::extract::{Json, Query, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::context::CallerId;
use crate::AppState;
use service_core::error::AppError;

#[derive(Debug, Deserialize, Validate)]
pub struct CheckQuery {
    /// Subject of the check; defaults to the caller.
    pub user_id: Option<Uuid>,
    #[validate(length(min = 1, max = 128))]
    pub action: String,
    pub repository_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub user_id: Uuid,
    pub action: String,
    pub repository_id: Uuid,
    pub allowed: bool,
}

/// GET /access/check
///
/// Any oracle failure answers `allowed: false`.
#[tracing::instrument(skip(state), fields(user_id = %caller.0))]
pub async fn check_access(
    State(state): State<AppState>,
    caller: CallerId,
    Query(query): Query<CheckQuery>,
) -> Result<Json<CheckResponse>, AppError> {
    query.validate()?;

    let user_id = query.user_id.unwrap_or(caller.0);
    let allowed = state
        .workflow
        .assignments
        .check(user_id, &query.action, query.repository_id)
        .await;

    Ok(Json(CheckResponse {
        user_id,
        action: query.action,
        repository_id: query.repository_id,
        allowed,
    }))
}
