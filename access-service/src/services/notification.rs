//! Notification dispatcher boundary.
//!
//! Delivery is awaited so ordering stays observable in tests, but failures
//! are only logged and counted; they never reach the workflow step that
//! triggered them.

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{instrument, warn};
use uuid::Uuid;

use super::metrics::NOTIFICATIONS_TOTAL;
use super::outcome::SideEffect;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: Uuid,
    pub title: String,
    pub body: String,
    pub metadata: serde_json::Value,
}

impl Notification {
    pub fn new(
        user_id: Uuid,
        title: impl Into<String>,
        body: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            user_id,
            title: title.into(),
            body: body.into(),
            metadata,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notifier not enabled")]
    NotEnabled,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    SendFailed(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Posts notifications as JSON to a webhook (e.g. the notification service).
pub struct WebhookNotifier {
    endpoint: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Connection(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Connection(format!("Failed to reach webhook: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::SendFailed(format!(
                "Webhook returned error status {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Mock notifier for testing. Records everything it is asked to send.
pub struct MockNotifier {
    enabled: bool,
    send_count: AtomicU64,
    sent: Mutex<Vec<Notification>>,
}

impl MockNotifier {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            send_count: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, user_id: Uuid) -> Vec<Notification> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if !self.enabled {
            return Err(NotifyError::NotEnabled);
        }
        self.send_count.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            user_id = %notification.user_id,
            title = %notification.title,
            "[MOCK] Notification would be sent"
        );
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

/// Writes notifications to the log. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            user_id = %notification.user_id,
            title = %notification.title,
            "Notification recorded without a delivery channel"
        );
        Ok(())
    }
}

/// Fans notifications out to a [`Notifier`], swallowing failures.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    #[instrument(skip(self, notifications), fields(count = notifications.len()))]
    pub async fn dispatch(&self, notifications: Vec<Notification>) -> SideEffect {
        if notifications.is_empty() {
            return SideEffect::Skipped;
        }

        let results = join_all(notifications.iter().map(|n| self.notifier.notify(n))).await;

        let mut failures = Vec::new();
        for (notification, result) in notifications.iter().zip(results) {
            match result {
                Ok(()) => NOTIFICATIONS_TOTAL.with_label_values(&["sent"]).inc(),
                Err(e) => {
                    NOTIFICATIONS_TOTAL.with_label_values(&["failed"]).inc();
                    warn!(
                        user_id = %notification.user_id,
                        title = %notification.title,
                        error = %e,
                        "Notification delivery failed"
                    );
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            SideEffect::Succeeded
        } else {
            SideEffect::failed(failures.join("; "))
        }
    }
}
