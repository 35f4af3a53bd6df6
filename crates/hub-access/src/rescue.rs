//! Break-glass admin bootstrap.
//!
//! Guarantees that a fresh deployment cannot lock its operators out: the
//! first persisted user to log in while no administrator exists is promoted,
//! and the last remaining administrator can be detected before a deletion or
//! demotion removes them.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::{AuthMethod, ConfigCache};
use crate::error::Result;
use crate::resolver::GroupPermissionResolver;
use crate::user::{User, UserStore};

/// Group ids preferred, in order, when promoting a user.
const PREFERRED_ADMIN_GROUPS: [&str; 2] = ["admins", "admin"];

/// Admin bootstrap and last-admin protection.
#[derive(Clone)]
pub struct AdminRescue {
    users: UserStore,
    resolver: Arc<GroupPermissionResolver>,
    config: Arc<dyn ConfigCache>,
}

impl AdminRescue {
    pub fn new(
        users: UserStore,
        resolver: Arc<GroupPermissionResolver>,
        config: Arc<dyn ConfigCache>,
    ) -> Self {
        Self {
            users,
            resolver,
            config,
        }
    }

    /// Whether `user` is active and its internal groups grant admin access.
    pub async fn is_admin_capable(&self, user: &User) -> bool {
        user.active && self.resolver.is_admin(&user.internal_groups).await
    }

    /// Every active persisted user with admin access.
    pub async fn admin_users(&self) -> Result<Vec<User>> {
        let mut admins = Vec::new();
        for user in self.users.list().await? {
            if self.is_admin_capable(&user).await {
                admins.push(user);
            }
        }
        Ok(admins)
    }

    /// Whether at least one administrator exists or can log in.
    ///
    /// Besides persisted users, an enabled LDAP or NTLM method counts when
    /// its default groups or group mappings can hand an admin group to a
    /// directory user.
    #[instrument(skip(self))]
    pub async fn has_any_admin(&self) -> Result<bool> {
        if !self.admin_users().await?.is_empty() {
            return Ok(true);
        }

        let admin_groups = self.resolver.admin_groups();
        if admin_groups.is_empty() {
            return Ok(false);
        }
        let is_admin_group = |g: &String| admin_groups.contains(g);
        let snapshot = self.resolver.snapshot();
        let globally_mapped = admin_groups
            .iter()
            .filter_map(|id| snapshot.get(id))
            .any(|g| !g.mappings.is_empty());

        let platform = self.config.platform();
        for (method, block) in platform.config_derived_methods() {
            let by_default = block.default_groups.iter().any(is_admin_group)
                || block
                    .providers
                    .iter()
                    .any(|p| p.default_groups.iter().any(is_admin_group));
            let by_mapping = globally_mapped
                || block
                    .group_mappings
                    .values()
                    .any(|targets| targets.iter().any(is_admin_group));

            if by_default || by_mapping {
                debug!(%method, by_default, by_mapping, "admin reachable through directory login");
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Promote `user` when no administrator exists yet.
    ///
    /// No-op for anonymous sessions, anonymous auth mode, and LDAP/NTLM
    /// logins. Returns the group the user was added to, if any.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn ensure_first_user_is_admin(
        &self,
        user: &User,
        auth_mode: AuthMethod,
    ) -> Result<Option<String>> {
        let platform = self.config.platform();
        if auth_mode == AuthMethod::Anonymous
            || platform.auth.mode == AuthMethod::Anonymous
            || user.id == "anonymous"
            || auth_mode.is_config_derived()
        {
            return Ok(None);
        }

        if self.has_any_admin().await? {
            return Ok(None);
        }

        let Some(group) = self.promotion_group() else {
            warn!("no administrator exists and no group grants admin access");
            return Ok(None);
        };

        // Re-checked under the users file lock: a concurrent first login may
        // have been promoted since `has_any_admin` ran.
        let admin_groups = self.resolver.admin_groups();
        let promoted = group.clone();
        let updated = self
            .users
            .update_if(
                &user.id,
                move |doc| {
                    !doc.users.values().any(|u| {
                        u.active && u.internal_groups.iter().any(|g| admin_groups.contains(g))
                    })
                },
                move |u| {
                    if !u.has_internal_group(&promoted) {
                        u.internal_groups.push(promoted);
                    }
                },
            )
            .await?;

        match updated {
            Some(_) => {
                info!(user_id = %user.id, group = %group, "first user promoted to administrator");
                Ok(Some(group))
            }
            None => {
                debug!(
                    user_id = %user.id,
                    "not promoted: user is not persisted or an administrator now exists"
                );
                Ok(None)
            }
        }
    }

    /// Whether `user_id` is the one and only administrator.
    pub async fn is_last_admin(&self, user_id: &str) -> Result<bool> {
        let admins = self.admin_users().await?;
        Ok(admins.len() == 1 && admins[0].id == user_id)
    }

    fn promotion_group(&self) -> Option<String> {
        let admin_groups = self.resolver.admin_groups();
        PREFERRED_ADMIN_GROUPS
            .into_iter()
            .find(|id| admin_groups.iter().any(|g| g == id))
            .map(|id| id.to_string())
            .or_else(|| admin_groups.into_iter().next())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
