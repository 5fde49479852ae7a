//! HTTP handlers for access-service.

pub mod access_requests;
pub mod audit;
pub mod check;
pub mod context;
pub mod metrics;
pub mod role_assignments;

pub use access_requests::*;
pub use audit::*;
pub use check::*;
pub use context::*;
pub use role_assignments::*;
