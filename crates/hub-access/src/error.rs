//! Error types for the access crate.
//!
//! Configuration errors (cycles, dangling parent references) are structural
//! and fail the configuration load. Account errors are per-login outcomes
//! the caller maps to a user-facing rejection.

use thiserror::Error;

/// Unified error type for group resolution and user management.
#[derive(Debug, Error)]
pub enum AccessError {
    // -- Configuration ------------------------------------------------------
    /// The group inheritance graph contains a cycle. `path` lists the groups
    /// along the back-edge, starting and ending with the same id.
    #[error("group inheritance cycle: {}", path.join(" -> "))]
    ConfigurationCycle { path: Vec<String> },

    /// A group inherits from a group that is not defined.
    #[error("group '{group}' inherits from unknown group '{parent}'")]
    UnknownParentGroup { group: String, parent: String },

    /// Platform or group configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // -- Accounts -----------------------------------------------------------
    /// The user exists but has been deactivated.
    #[error("account disabled")]
    AccountDisabled,

    /// No matching user exists and self-registration is off for this method.
    #[error("registration not allowed for {method} users")]
    SelfSignupDisallowed { method: String },

    /// The referenced user does not exist.
    #[error("user not found: {id}")]
    UserNotFound { id: String },

    // -- Underlying ---------------------------------------------------------
    #[error(transparent)]
    Store(#[from] hub_store::StoreError),
}

impl AccessError {
    /// Whether this error indicates a broken deployment rather than a
    /// per-request condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationCycle { .. } | Self::UnknownParentGroup { .. } | Self::InvalidConfig { .. }
        )
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AccessError>;
