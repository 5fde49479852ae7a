//! User model - identities that request and approve access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    /// Whether the user has enrolled a device for biometric approval.
    pub biometric_enabled: bool,
    pub created_utc: DateTime<Utc>,
}

impl User {
    /// Create a new user without biometric enrolment.
    pub fn new(email: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            email: email.into(),
            display_name,
            biometric_enabled: false,
            created_utc: Utc::now(),
        }
    }

    /// Builder-style toggle for biometric enrolment.
    pub fn with_biometrics(mut self, enabled: bool) -> Self {
        self.biometric_enabled = enabled;
        self
    }

    /// Attributes pushed to the authorization oracle alongside the principal.
    pub fn profile_attributes(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut attrs = serde_json::Map::new();
        attrs.insert("email".to_string(), self.email.clone().into());
        if let Some(name) = &self.display_name {
            attrs.insert("display_name".to_string(), name.clone().into());
        }
        attrs.insert(
            "biometric_enabled".to_string(),
            self.biometric_enabled.into(),
        );
        attrs
    }
}
