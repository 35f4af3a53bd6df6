//! External identity persistence and session group merging.
//!
//! A login from an identity provider goes through
//! [`UserManager::validate_and_persist_external_user`]:
//!
//! 1. find the stored user by linked subject, username, or email;
//! 2. reject a disabled account, or a new account when self-signup is off;
//! 3. create or update the record (never touching `internalGroups`);
//! 4. run the admin bootstrap;
//! 5. merge mapped external groups, automatic groups, and internal groups
//!    into the session's effective group set and resolve its permissions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::{AuthMethod, ConfigCache, PlatformConfig};
use crate::error::{AccessError, Result};
use crate::group::Permissions;
use crate::rescue::AdminRescue;
use crate::resolver::GroupPermissionResolver;
use crate::user::{ExternalIdentity, User, UserStore};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A principal as asserted by an identity provider for one login.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalUser {
    pub method: Option<AuthMethod>,
    /// Provider subject; falls back to `username` when empty.
    pub subject: String,
    pub provider: Option<String>,
    pub username: String,
    pub email: Option<String>,
    pub name: Option<String>,
    /// Group names as the provider reports them (not internal ids).
    pub groups: Vec<String>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ExternalUser {
    pub fn new(method: AuthMethod, username: impl Into<String>) -> Self {
        Self {
            method: Some(method),
            username: username.into(),
            ..Self::default()
        }
    }

    fn method(&self) -> AuthMethod {
        self.method.unwrap_or(AuthMethod::Local)
    }

    fn subject(&self) -> &str {
        if self.subject.is_empty() {
            &self.username
        } else {
            &self.subject
        }
    }
}

/// The authenticated principal for one session, ready to be put in a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: String,
    pub username: String,
    pub name: Option<String>,
    pub email: Option<String>,
    /// Effective groups for this session only.
    pub groups: Vec<String>,
    pub provider: Option<String>,
    pub auth_mode: String,
    pub permissions: Permissions,
}

impl SessionUser {
    pub fn is_admin(&self) -> bool {
        self.permissions.admin_access
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Group merging
// ═══════════════════════════════════════════════════════════════════════

/// Union of group lists in first-seen order, without duplicates.
pub fn merge_user_groups<S: AsRef<[String]>>(sources: &[S]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for group in sources.iter().flat_map(|s| s.as_ref().iter()) {
        if !merged.contains(group) {
            merged.push(group.clone());
        }
    }
    merged
}

// ═══════════════════════════════════════════════════════════════════════
//  UserManager
// ═══════════════════════════════════════════════════════════════════════

/// Persists external identities and computes session groups.
#[derive(Clone)]
pub struct UserManager {
    users: UserStore,
    resolver: Arc<GroupPermissionResolver>,
    config: Arc<dyn ConfigCache>,
    rescue: AdminRescue,
}

impl UserManager {
    pub fn new(
        users: UserStore,
        resolver: Arc<GroupPermissionResolver>,
        config: Arc<dyn ConfigCache>,
    ) -> Self {
        let rescue = AdminRescue::new(users.clone(), Arc::clone(&resolver), Arc::clone(&config));
        Self {
            users,
            resolver,
            config,
            rescue,
        }
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn rescue(&self) -> &AdminRescue {
        &self.rescue
    }

    pub async fn find_user_by_identifier(&self, ident: &str) -> Result<Option<User>> {
        self.users.find_by_identifier(ident).await
    }

    async fn find_existing(&self, ext: &ExternalUser) -> Result<Option<User>> {
        if let Some(user) = self.users.find_by_identifier(ext.subject()).await? {
            return Ok(Some(user));
        }
        if let Some(email) = ext.email.as_deref()
            && let Some(user) = self.users.find_by_identifier(email).await?
        {
            return Ok(Some(user));
        }
        self.users.find_by_identifier(&ext.username).await
    }

    /// Create a user on first sight of an identity, or refresh the stored
    /// identity block and profile fields. `internalGroups` is left as is.
    #[instrument(skip(self, ext), fields(method = %ext.method(), username = %ext.username))]
    pub async fn create_or_update_external_user(&self, ext: &ExternalUser) -> Result<User> {
        let now = self.users.now();
        let identity = ExternalIdentity {
            method: ext.method(),
            subject: ext.subject().to_string(),
            provider: ext.provider.clone(),
            extra: ext.extra.clone(),
            last_seen: now,
        };

        match self.find_existing(ext).await? {
            Some(existing) => {
                let email = ext.email.clone();
                let name = ext.name.clone();
                let updated = self
                    .users
                    .update(&existing.id, move |u| {
                        u.link_identity(identity);
                        if email.is_some() {
                            u.email = email;
                        }
                        if name.is_some() {
                            u.name = name;
                        }
                    })
                    .await?;
                updated.ok_or(AccessError::UserNotFound { id: existing.id })
            }
            None => {
                let mut user = User::new(ext.username.clone(), now);
                user.email = ext.email.clone();
                user.name = ext.name.clone();
                user.link_identity(identity);
                let user = self.users.save(user).await?;
                info!(user_id = %user.id, method = %ext.method(), "external user created");
                Ok(user)
            }
        }
    }

    /// Groups granted at login without being stored: the authenticated
    /// group plus method and provider defaults.
    fn automatic_groups(platform: &PlatformConfig, ext: &ExternalUser) -> Vec<String> {
        let mut groups = vec![platform.auth.authenticated_group.clone()];
        groups.extend(platform.default_groups(ext.method(), ext.provider.as_deref()));
        groups
    }

    /// External group names mapped to internal ids through the group
    /// `mappings` and the method's own `groupMappings`. Empty input maps to
    /// nothing rather than to the anonymous fallback.
    fn mapped_external_groups(&self, platform: &PlatformConfig, ext: &ExternalUser) -> Vec<String> {
        if ext.groups.is_empty() {
            return Vec::new();
        }
        let mut mapped = self.resolver.map_external_groups(&ext.groups);
        if let Some(block) = platform.method(ext.method()) {
            for name in &ext.groups {
                if let Some(targets) = block.group_mappings.get(name) {
                    mapped.extend(targets.iter().cloned());
                }
            }
        }
        mapped
    }

    /// Effective groups for a session of `user` logging in as `ext`.
    pub fn effective_groups(&self, ext: &ExternalUser, user: &User) -> Vec<String> {
        let platform = self.config.platform();
        let external = self.mapped_external_groups(&platform, ext);
        let automatic = Self::automatic_groups(&platform, ext);
        merge_user_groups(&[&external, &automatic, &user.internal_groups])
    }

    /// Full login path for an external identity. See the module docs.
    ///
    /// # Errors
    ///
    /// [`AccessError::AccountDisabled`] for a deactivated user and
    /// [`AccessError::SelfSignupDisallowed`] when no user matches and the
    /// method does not allow registration.
    #[instrument(skip(self, ext), fields(method = %ext.method(), username = %ext.username))]
    pub async fn validate_and_persist_external_user(&self, ext: &ExternalUser) -> Result<SessionUser> {
        let platform = self.config.platform();
        let method = ext.method();

        match self.find_existing(ext).await? {
            Some(existing) if !existing.active => {
                debug!(user_id = %existing.id, "login rejected for disabled account");
                return Err(AccessError::AccountDisabled);
            }
            Some(_) => {}
            None => {
                if !platform.allow_self_signup(method, ext.provider.as_deref()) {
                    return Err(AccessError::SelfSignupDisallowed {
                        method: method.to_string(),
                    });
                }
            }
        }

        let user = self.create_or_update_external_user(ext).await?;
        self.users.record_login(&user.id).await?;

        let user = match self.rescue.ensure_first_user_is_admin(&user, method).await? {
            Some(_) => self.users.get(&user.id).await?.unwrap_or(user),
            None => user,
        };

        let groups = self.effective_groups(ext, &user);
        let permissions = self.resolver.permissions_for_user(&groups).await;
        debug!(user_id = %user.id, groups = groups.len(), admin = permissions.admin_access, "session resolved");

        Ok(SessionUser {
            id: user.id,
            username: user.username,
            name: user.name,
            email: user.email,
            groups,
            provider: ext.provider.clone().or_else(|| Some(method.to_string())),
            auth_mode: method.to_string(),
            permissions,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use hub_store::system_clock;

    use super::*;
    use crate::config::StaticConfig;
    use crate::group::GroupsDocument;

    const GROUPS: &str = r#"{ "groups": {
        "anonymous":     { "permissions": { "apps": ["welcome"] } },
        "authenticated": { "permissions": { "apps": ["chat"] } },
        "users":         { "mappings": ["Hub-Users"], "permissions": { "models": ["gpt-4"] } },
        "finance":       { "permissions": { "apps": ["ledger"] } },
        "admins":        { "permissions": { "adminAccess": true } }
    } }"#;

    fn manager(dir: &tempfile::TempDir, platform: &str) -> UserManager {
        let doc = GroupsDocument::from_json(GROUPS).unwrap();
        let resolver = Arc::new(GroupPermissionResolver::new(&doc).unwrap());
        let platform = PlatformConfig::from_json(platform).unwrap();
        let config: Arc<dyn ConfigCache> = Arc::new(StaticConfig::new(platform, doc));
        let users = UserStore::new(dir.path().join("users.json"), system_clock());
        UserManager::new(users, resolver, config)
    }

    fn oidc_user(name: &str, groups: &[&str]) -> ExternalUser {
        ExternalUser {
            subject: format!("sub-{name}"),
            provider: Some("entra".into()),
            email: Some(format!("{name}@example.com")),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            ..ExternalUser::new(AuthMethod::Oidc, name)
        }
    }

    #[test]
    fn merge_keeps_first_seen_order() {
        let a = vec!["x".to_string(), "y".to_string()];
        let b = vec!["y".to_string(), "z".to_string()];
        assert_eq!(merge_user_groups(&[&a, &b]), vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn self_signup_gate_rejects_unknown_user() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir, r#"{ "oidcAuth": { "enabled": true, "allowSelfSignup": false } }"#);
        let err = mgr
            .validate_and_persist_external_user(&oidc_user("eve", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::SelfSignupDisallowed { ref method } if method == "oidc"));
        assert!(mgr.users().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn proxy_signup_allowed_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir, "{}");
        let ext = ExternalUser::new(AuthMethod::Proxy, "gw-user");
        let session = mgr.validate_and_persist_external_user(&ext).await.unwrap();
        assert_eq!(session.auth_mode, "proxy");
        assert_eq!(mgr.users().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn external_groups_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(
            &dir,
            r#"{ "oidcAuth": { "enabled": true, "allowSelfSignup": true,
                 "groupMappings": { "Finance-Team": ["finance"] } } }"#,
        );

        // Seed an admin so the bootstrap stays out of the way.
        let mut admin = User::new("root", mgr.users().now());
        admin.internal_groups = vec!["admins".into()];
        mgr.users().save(admin).await.unwrap();

        let session = mgr
            .validate_and_persist_external_user(&oidc_user("dave", &["Hub-Users", "Finance-Team"]))
            .await
            .unwrap();
        assert_eq!(session.groups, vec!["users", "finance", "authenticated"]);
        assert!(session.permissions.can_access_app("ledger"));
        assert!(session.permissions.can_access_model("gpt-4"));

        let stored = mgr.find_user_by_identifier("sub-dave").await.unwrap().unwrap();
        assert!(stored.internal_groups.is_empty());
        assert!(stored.last_active_date.is_some());
    }

    #[tokio::test]
    async fn update_preserves_internal_groups() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir, r#"{ "oidcAuth": { "enabled": true, "allowSelfSignup": true } }"#);

        let created = mgr.create_or_update_external_user(&oidc_user("fay", &[])).await.unwrap();
        mgr.users()
            .update(&created.id, |u| u.internal_groups.push("finance".into()))
            .await
            .unwrap();

        let mut again = oidc_user("fay", &[]);
        again.name = Some("Fay Doe".into());
        let updated = mgr.create_or_update_external_user(&again).await.unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.internal_groups, vec!["finance"]);
        assert_eq!(updated.name.as_deref(), Some("Fay Doe"));
    }

    #[tokio::test]
    async fn disabled_account_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir, r#"{ "oidcAuth": { "enabled": true, "allowSelfSignup": true } }"#);
        let user = mgr.create_or_update_external_user(&oidc_user("gus", &[])).await.unwrap();
        mgr.users().update(&user.id, |u| u.active = false).await.unwrap();

        let err = mgr
            .validate_and_persist_external_user(&oidc_user("gus", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::AccountDisabled));
    }

    #[tokio::test]
    async fn first_login_is_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir, r#"{ "localAuth": { "enabled": true, "allowSelfSignup": true } }"#);
        let session = mgr
            .validate_and_persist_external_user(&ExternalUser::new(AuthMethod::Local, "first"))
            .await
            .unwrap();
        assert!(session.is_admin());
        assert!(session.groups.contains(&"admins".to_string()));
    }
}
