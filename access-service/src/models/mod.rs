//! Domain models for access-service.

mod access_request;
mod audit_log;
mod organization;
mod role;
mod role_assignment;
mod user;

pub use access_request::{
    AccessRequest, AccessRequestFilter, AccessRequestStatus, ApprovalTally, CallerRole,
    NewAccessRequest, RequestClosure, RequestType, TransitionError,
};
pub use audit_log::{
    AuditAction, AuditLogEntry, AuditQuery, AuditRecord, ClientContext, EntityType,
};
pub use organization::{Organization, Repository};
pub use role::{ordered_action_set, Role};
pub use role_assignment::RoleAssignment;
pub use user::User;

use serde::Serialize;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

/// One page of a larger result set.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    /// Slice an already filtered and ordered set.
    pub fn from_sorted(all: Vec<T>, page: u32, per_page: u32) -> Self {
        let (page, per_page) = normalize_page(page, per_page);
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(page_offset(page, per_page) as usize)
            .take(per_page as usize)
            .collect();
        Self {
            items,
            total,
            page,
            per_page,
        }
    }
}

/// Clamp 1-based page and page size to sane bounds.
pub fn normalize_page(page: u32, per_page: u32) -> (u32, u32) {
    let per_page = if per_page == 0 {
        DEFAULT_PAGE_SIZE
    } else {
        per_page.min(MAX_PAGE_SIZE)
    };
    (page.max(1), per_page)
}

pub fn page_offset(page: u32, per_page: u32) -> u64 {
    u64::from(page.saturating_sub(1)) * u64::from(per_page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_one_based_and_clamped() {
        assert_eq!(normalize_page(0, 0), (1, DEFAULT_PAGE_SIZE));
        assert_eq!(normalize_page(3, 10_000), (3, MAX_PAGE_SIZE));
        assert_eq!(page_offset(3, 20), 40);
    }

    #[test]
    fn from_sorted_slices_the_requested_page() {
        let page = Page::from_sorted((1..=25).collect::<Vec<_>>(), 2, 10);
        assert_eq!(page.items, (11..=20).collect::<Vec<_>>());
        assert_eq!(page.total, 25);

        let past_end = Page::from_sorted((1..=5).collect::<Vec<_>>(), 4, 10);
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 5);
    }
}
