//! HTTP client for a remote policy-decision service.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    AuthorizationOracle, OracleError, PermissionQuery, Principal, ResourceDefinition,
    RoleBinding, RoleDefinition,
};

#[derive(Debug, Clone)]
pub struct RemoteOracleConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

pub struct RemoteOracle {
    config: RemoteOracleConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    allow: bool,
}

impl RemoteOracle {
    pub fn new(config: RemoteOracleConfig) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OracleError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        tracing::info!(base_url = %config.base_url, "Remote authorization oracle configured");

        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, OracleError> {
        let response = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| OracleError::Transport(format!("Failed to reach oracle: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, body))
    }
}

/// Map a non-success HTTP status onto the oracle error taxonomy.
fn classify(status: StatusCode, body: String) -> OracleError {
    match status {
        StatusCode::CONFLICT => OracleError::AlreadyExists(body),
        StatusCode::NOT_FOUND => OracleError::NotFound(body),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            OracleError::Transport(format!("{}: {}", status, body))
        }
        s if s.is_server_error() => OracleError::Transport(format!("{}: {}", status, body)),
        _ => OracleError::Rejected(format!("{}: {}", status, body)),
    }
}

#[async_trait]
impl AuthorizationOracle for RemoteOracle {
    async fn sync_principal(&self, principal: &Principal) -> Result<(), OracleError> {
        let path = format!("principals/{}", principal.user_id);
        self.send(Method::PUT, &path, principal).await?;
        Ok(())
    }

    async fn provision_resource(&self, resource: &ResourceDefinition) -> Result<(), OracleError> {
        self.send(Method::POST, "resources", resource).await?;
        Ok(())
    }

    async fn provision_role(&self, role: &RoleDefinition) -> Result<(), OracleError> {
        self.send(Method::POST, "roles", role).await?;
        Ok(())
    }

    async fn bind_role(&self, binding: &RoleBinding) -> Result<(), OracleError> {
        self.send(Method::POST, "role-bindings", binding).await?;
        Ok(())
    }

    async fn unbind_role(&self, binding: &RoleBinding) -> Result<(), OracleError> {
        self.send(Method::DELETE, "role-bindings", binding).await?;
        Ok(())
    }

    async fn check(&self, query: &PermissionQuery) -> Result<bool, OracleError> {
        let response = self.send(Method::POST, "check", query).await?;
        let decision: CheckResponse = response
            .json()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;
        Ok(decision.allow)
    }
}
