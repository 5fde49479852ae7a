//! Role assignment model - time-bounded user→role grants over one repository.
//!
//! Assignments are immutable once created: they either expire or are deleted
//! by revocation. The only mutable bit is the oracle sync marker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role assignment entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub assignment_id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub repository_id: Uuid,
    /// Access request that produced this grant, if any.
    pub request_id: Option<Uuid>,
    pub expires_utc: Option<DateTime<Utc>>,
    /// Set once the grant has been bound at the authorization oracle.
    pub oracle_synced: bool,
    pub created_utc: DateTime<Utc>,
}

impl RoleAssignment {
    /// Create a new assignment issued for an approved access request.
    pub fn for_request(
        request_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
        repository_id: Uuid,
        expires_utc: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            assignment_id: Uuid::new_v4(),
            user_id,
            role_id,
            repository_id,
            request_id: Some(request_id),
            expires_utc,
            oracle_synced: false,
            created_utc: Utc::now(),
        }
    }

    /// Check if the grant is in force at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc.is_none_or(|end| end > now)
    }

    /// Check if the grant has lapsed at `now`.
    pub fn has_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_active_at(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn open_ended_grants_never_expire() {
        let grant = RoleAssignment::for_request(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
        );
        assert!(grant.is_active_at(Utc::now() + Duration::days(3650)));
        assert!(!grant.oracle_synced);
    }

    #[test]
    fn bounded_grants_lapse_at_expiry() {
        let now = Utc::now();
        let grant = RoleAssignment::for_request(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Some(now + Duration::hours(1)),
        );
        assert!(grant.is_active_at(now));
        assert!(grant.has_expired_at(now + Duration::hours(1)));
    }
}
