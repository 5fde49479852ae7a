use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{
    AuthorizationOracle, OracleError, PermissionQuery, Principal, ResourceDefinition,
    RoleBinding, RoleDefinition,
};
use crate::services::metrics::ORACLE_CALLS_TOTAL;

/// Backoff settings for transport-class oracle failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// `None` disables retries entirely.
    pub max_elapsed: Option<Duration>,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_elapsed: Some(Duration::from_secs(10)),
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_elapsed: None,
            ..Default::default()
        }
    }

    /// Short intervals for tests.
    pub fn quick() -> Self {
        Self {
            max_elapsed: Some(Duration::from_millis(500)),
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
        }
    }

    fn backoff(&self) -> Option<ExponentialBackoff> {
        self.max_elapsed.map(|max_elapsed| ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: Some(max_elapsed),
            ..Default::default()
        })
    }
}

/// Oracle facade used by the workflow.
///
/// Creation calls are idempotent (`AlreadyExists` is success), unbinding a
/// missing binding is success, transport errors are retried with backoff, and
/// `check` fails closed.
#[derive(Clone)]
pub struct OracleClient {
    oracle: Arc<dyn AuthorizationOracle>,
    retry: RetryPolicy,
}

impl OracleClient {
    pub fn new(oracle: Arc<dyn AuthorizationOracle>, retry: RetryPolicy) -> Self {
        Self { oracle, retry }
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, OracleError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OracleError>>,
    {
        let result = match self.retry.backoff() {
            Some(backoff) => {
                let f = &f;
                retry(backoff, || async move {
                    f().await.map_err(|e| {
                        if e.is_transient() {
                            warn!(operation, error = %e, "Transient oracle failure, retrying");
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                })
                .await
            }
            None => f().await,
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(OracleError::AlreadyExists(_)) => "exists",
            Err(_) => "error",
        };
        ORACLE_CALLS_TOTAL
            .with_label_values(&[operation, status])
            .inc();
        result
    }

    #[instrument(skip(self, principal), fields(user_id = %principal.user_id))]
    pub async fn sync_principal(&self, principal: &Principal) -> Result<(), OracleError> {
        idempotent(
            self.call("sync_principal", || self.oracle.sync_principal(principal))
                .await,
        )
    }

    #[instrument(skip(self, resource), fields(key = %resource.key))]
    pub async fn provision_resource(&self, resource: &ResourceDefinition) -> Result<(), OracleError> {
        idempotent(
            self.call("provision_resource", || self.oracle.provision_resource(resource))
                .await,
        )
    }

    #[instrument(skip(self, role), fields(key = %role.key))]
    pub async fn provision_role(&self, role: &RoleDefinition) -> Result<(), OracleError> {
        idempotent(
            self.call("provision_role", || self.oracle.provision_role(role))
                .await,
        )
    }

    #[instrument(skip(self, binding), fields(user_id = %binding.user_id, role = %binding.role_key))]
    pub async fn bind_role(&self, binding: &RoleBinding) -> Result<(), OracleError> {
        idempotent(self.call("bind_role", || self.oracle.bind_role(binding)).await)
    }

    #[instrument(skip(self, binding), fields(user_id = %binding.user_id, role = %binding.role_key))]
    pub async fn unbind_role(&self, binding: &RoleBinding) -> Result<(), OracleError> {
        match self
            .call("unbind_role", || self.oracle.unbind_role(binding))
            .await
        {
            Err(OracleError::NotFound(what)) => {
                debug!(%what, "Binding already absent at oracle");
                Ok(())
            }
            other => other,
        }
    }

    /// Fail-closed permission check: any error is a denial.
    #[instrument(skip(self, query), fields(user_id = %query.user_id, action = %query.action))]
    pub async fn check(&self, query: &PermissionQuery) -> bool {
        let result = self.oracle.check(query).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        ORACLE_CALLS_TOTAL.with_label_values(&["check", status]).inc();

        match result {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(error = %e, "Permission check failed, denying");
                false
            }
        }
    }
}

fn idempotent(result: Result<(), OracleError>) -> Result<(), OracleError> {
    match result {
        Err(OracleError::AlreadyExists(what)) => {
            debug!(%what, "Already provisioned at oracle");
            Ok(())
        }
        other => other,
    }
}
