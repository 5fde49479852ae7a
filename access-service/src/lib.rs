pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;

use service_core::axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method},
    middleware::from_fn,
    routing::{delete, get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware, security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::services::AccessWorkflow;

/// Identity reported by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub environment: String,
}

#[derive(Clone)]
pub struct AppState {
    pub service: ServiceInfo,
    pub workflow: AccessWorkflow,
}

pub fn build_router(state: AppState, allowed_origins: &[String]) -> Result<Router, AppError> {
    let origins = allowed_origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Invalid CORS origin '{}': {}", o, e))
            })
        })
        .collect::<Result<Vec<HeaderValue>, AppError>>()?;

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route(
            "/access-requests",
            post(handlers::create_access_request).get(handlers::list_access_requests),
        )
        .route("/access-requests/:id", get(handlers::get_access_request))
        .route(
            "/access-requests/:id/approve",
            post(handlers::approve_access_request),
        )
        .route(
            "/access-requests/:id/reject",
            post(handlers::reject_access_request),
        )
        .route(
            "/role-assignments/:id",
            delete(handlers::revoke_role_assignment),
        )
        .route("/audit-logs", get(handlers::list_audit_logs))
        .route("/audit-logs/actions", get(handlers::list_audit_actions))
        .route(
            "/audit-logs/entity-types",
            get(handlers::list_audit_entity_types),
        )
        .route("/access/check", get(handlers::check_access))
        .with_state(state)
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::CONTENT_TYPE,
                    HeaderName::from_static("x-user-id"),
                    HeaderName::from_static("x-request-id"),
                ]),
        );

    Ok(app)
}

/// Service health check
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.workflow.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Store health check failed");
        AppError::from(e)
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.service.name,
        "version": state.service.version,
        "environment": state.service.environment,
        "checks": {
            "store": "up"
        }
    })))
}
