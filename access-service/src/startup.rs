//! Component wiring from configuration and the background maintenance loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{AccessConfig, OracleMode, StorageBackend};
use crate::db;
use crate::services::{
    AccessStore, AccessWorkflow, AuthorizationOracle, BiometricVerifier, HmacBiometricVerifier,
    LocalOracle, LogNotifier, MemoryStore, Notifier, OracleClient, PgStore, RemoteOracle,
    WebhookNotifier,
};
use crate::{AppState, ServiceInfo};
use service_core::error::AppError;

/// Build every collaborator named by the configuration.
pub async fn build_state(config: &AccessConfig) -> Result<AppState, AppError> {
    let store: Arc<dyn AccessStore> = match config.storage {
        StorageBackend::Postgres => {
            let pool = db::create_pool(&config.database).await?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;
            Arc::new(PgStore::new(pool))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let oracle: Arc<dyn AuthorizationOracle> = match config.oracle.mode {
        OracleMode::Remote => Arc::new(
            RemoteOracle::new(config.oracle.remote())
                .map_err(|e| AppError::ConfigError(anyhow::Error::new(e)))?,
        ),
        OracleMode::Local => Arc::new(LocalOracle::new()),
    };
    let oracle = OracleClient::new(oracle, config.oracle.retry_policy());

    let verifier: Arc<dyn BiometricVerifier> = Arc::new(HmacBiometricVerifier::new(
        config.biometric.secret.as_bytes().to_vec(),
        chrono::Duration::seconds(config.biometric.token_ttl_seconds),
    ));

    let notifier: Arc<dyn Notifier> = match &config.notification.webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(
                url.clone(),
                Duration::from_millis(config.notification.timeout_ms),
            )
            .map_err(|e| AppError::ConfigError(anyhow::Error::new(e)))?,
        ),
        None => Arc::new(LogNotifier),
    };

    tracing::info!(
        storage = ?config.storage,
        oracle = ?config.oracle.mode,
        webhook = config.notification.webhook_url.is_some(),
        "Access workflow initialized"
    );

    Ok(AppState {
        service: ServiceInfo {
            name: config.service_name.clone(),
            version: config.service_version.clone(),
            environment: format!("{:?}", config.environment),
        },
        workflow: AccessWorkflow::new(store, oracle, verifier, notifier),
    })
}

/// Run [`AccessWorkflow::run_maintenance`] every `interval` until the task
/// is aborted.
pub fn spawn_maintenance(workflow: AccessWorkflow, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match workflow.run_maintenance(chrono::Utc::now()).await {
                Ok(report) => tracing::info!(
                    expired_requests = report.expired_requests,
                    purged_assignments = report.purged_assignments,
                    resynced = report.resync.synced,
                    resync_failed = report.resync.failed,
                    "Maintenance pass completed"
                ),
                Err(e) => tracing::error!(error = %e, "Maintenance pass failed"),
            }
        }
    })
}
