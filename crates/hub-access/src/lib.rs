//! # hub-access
//!
//! Group-based access control for the AI Hub.
//!
//! ```text
//!  IdP login ──► UserManager ──► UserStore (users.json, internalGroups only)
//!                    │
//!                    ├──► AdminRescue (first-user bootstrap, last-admin guard)
//!                    ▼
//!        GroupPermissionResolver (groups.json, inheritance, mappings)
//!                    │
//!                    ▼
//!              SessionUser { groups, permissions }
//! ```
//!
//! Configuration is read through the [`ConfigCache`] trait; the file-backed
//! [`FileConfigCache`] loads `platform.json`, `groups.json`, `models.json`
//! and `apps.json` from a contents directory.

pub mod config;
pub mod error;
pub mod group;
pub mod manager;
pub mod rescue;
pub mod resolver;
pub mod user;

// ── re-exports ───────────────────────────────────────────────────────

pub use config::{
    AuthMethod, CatalogEntry, ConfigCache, FileConfigCache, JwtAlgorithm, JwtSettings,
    MAX_TOKEN_LIFETIME_MINUTES, MAX_TTL_DAYS, MethodConfig, OAuthSettings, PlatformConfig,
    StaticConfig,
};
pub use error::{AccessError, Result};
pub use group::{Group, GroupsDocument, Permissions, ResourceSet};
pub use manager::{ExternalUser, SessionUser, UserManager, merge_user_groups};
pub use rescue::AdminRescue;
pub use resolver::{ANONYMOUS_GROUP, GroupPermissionResolver, ResolvedGroups, resolve_inheritance};
pub use user::{ExternalIdentity, User, UserStore, UsersDocument};
