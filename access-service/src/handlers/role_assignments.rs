use axum::extract::{Json, Path, State};
use uuid::Uuid;

use super::context::{reported, CallerId};
use crate::models::ClientContext;
use crate::services::RevokeOutcome;
use crate::AppState;
use service_core::error::AppError;

/// DELETE /role-assignments/:id
///
/// The repository owner or the grantee may revoke.
#[tracing::instrument(skip(state, context), fields(user_id = %caller.0))]
pub async fn revoke_role_assignment(
    State(state): State<AppState>,
    caller: CallerId,
    context: ClientContext,
    Path(assignment_id): Path<Uuid>,
) -> Result<Json<RevokeOutcome>, AppError> {
    let result = state
        .workflow
        .assignments
        .revoke(assignment_id, caller.0, &context)
        .await;
    let outcome = reported(&state, "revoke_role_assignment", Some(caller.0), &context, result).await?;
    Ok(Json(outcome))
}
