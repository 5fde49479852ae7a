use service_core::error::AppError;
use thiserror::Error;

use crate::models::TransitionError;
use crate::services::oracle::OracleError;

/// Domain error taxonomy for the access-request workflow.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    Verification(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable kind string, matching the HTTP error body.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Authorization(_) => "forbidden",
            ServiceError::Verification(_) => "verification_failed",
            ServiceError::ExternalService(_) => "bad_gateway",
            ServiceError::Database(_) => "database",
            ServiceError::Internal(_) => "internal",
        }
    }

    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        ServiceError::NotFound(format!("{} {} not found", entity, id))
    }
}

impl From<TransitionError> for ServiceError {
    fn from(err: TransitionError) -> Self {
        ServiceError::Conflict(err.to_string())
    }
}

impl From<OracleError> for ServiceError {
    fn from(err: OracleError) -> Self {
        ServiceError::ExternalService(err.to_string())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(e) => AppError::InvalidInput(anyhow::anyhow!(e)),
            ServiceError::NotFound(e) => AppError::NotFound(anyhow::anyhow!(e)),
            ServiceError::Conflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            ServiceError::Authorization(e) => AppError::Forbidden(anyhow::anyhow!(e)),
            ServiceError::Verification(e) => AppError::VerificationFailed(anyhow::anyhow!(e)),
            ServiceError::ExternalService(e) => AppError::BadGateway(e),
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Internal(e) => AppError::InternalError(anyhow::anyhow!(e)),
        }
    }
}
