//! Request-scoped caller identity and client context.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use service_core::middleware::tracing::REQUEST_ID_HEADER;
use std::convert::Infallible;
use uuid::Uuid;

use crate::models::{AuditAction, AuditRecord, ClientContext, EntityType};
use crate::services::ServiceError;
use crate::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated caller, taken from `x-user-id`.
///
/// The header is set by the trusted frontend after it has authenticated the
/// user; this service never sees credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing x-user-id header")))?;

        let user_id = Uuid::parse_str(raw.trim()).map_err(|_| {
            AppError::Unauthorized(anyhow::anyhow!("x-user-id is not a valid UUID"))
        })?;

        tracing::Span::current().record("user_id", tracing::field::display(user_id));
        Ok(CallerId(user_id))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        // First hop of x-forwarded-for is the original client.
        let ip_address = header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
            .or_else(|| header("x-real-ip"));

        Ok(ClientContext {
            ip_address,
            user_agent: header("user-agent"),
            request_id: header(REQUEST_ID_HEADER),
        })
    }
}

/// Convert a service result for the HTTP edge, recording server-side
/// failures in the audit trail.
pub async fn reported<T>(
    state: &AppState,
    operation: &str,
    caller: Option<Uuid>,
    context: &ClientContext,
    result: Result<T, ServiceError>,
) -> Result<T, AppError> {
    let err = match result {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    let kind = err.kind();
    let message = err.to_string();
    let app_error = AppError::from(err);
    if app_error.is_server_error() {
        let mut record = AuditRecord::new(
            AuditAction::ServerError,
            EntityType::HttpRequest,
            context.request_id.as_deref().unwrap_or("-"),
            format!("{} failed", operation),
        )
        .metadata(serde_json::json!({
            "operation": operation,
            "kind": kind,
            "error": message,
        }))
        .context(context);
        if let Some(caller) = caller {
            record = record.actor(caller);
        }
        state.workflow.audit.append(record).await;
    }
    Err(app_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn caller_id_requires_a_uuid_header() {
        let mut missing = parts(&[]).await;
        assert!(CallerId::from_request_parts(&mut missing, &()).await.is_err());

        let mut garbage = parts(&[(USER_ID_HEADER, "alice")]).await;
        let err = CallerId::from_request_parts(&mut garbage, &())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unauthorized");

        let id = Uuid::new_v4();
        let mut valid = parts(&[(USER_ID_HEADER, &id.to_string())]).await;
        assert_eq!(
            CallerId::from_request_parts(&mut valid, &()).await.unwrap(),
            CallerId(id)
        );
    }

    #[tokio::test]
    async fn client_context_takes_first_forwarded_hop() {
        let mut p = parts(&[
            ("x-forwarded-for", "203.0.113.9, 10.0.0.1"),
            ("user-agent", "cli/2.1"),
            (REQUEST_ID_HEADER, "req-42"),
        ])
        .await;
        let ctx = ClientContext::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(ctx.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(ctx.user_agent.as_deref(), Some("cli/2.1"));
        assert_eq!(ctx.request_id.as_deref(), Some("req-42"));
    }

    #[tokio::test]
    async fn client_context_tolerates_missing_headers() {
        let mut p = parts(&[]).await;
        let ctx = ClientContext::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(ctx, ClientContext::default());
    }
}
