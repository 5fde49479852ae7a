//! Recorded result of a best-effort side effect.

use serde::Serialize;
use std::fmt;

/// Outcome of a follow-up that runs after the committed state transition
/// (oracle sync, notification). Recorded, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SideEffect {
    Succeeded,
    /// Nothing to do (e.g. actions-only request, no oracle binding needed).
    Skipped,
    Failed { reason: String },
}

impl SideEffect {
    pub fn failed(reason: impl fmt::Display) -> Self {
        SideEffect::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SideEffect::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffect::Succeeded => "succeeded",
            SideEffect::Skipped => "skipped",
            SideEffect::Failed { .. } => "failed",
        }
    }
}
