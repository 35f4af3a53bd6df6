//! Persisted user records (`users.json`).
//!
//! Only manually assigned `internalGroups` are stored. Groups asserted by an
//! identity provider are recomputed at every login and never written here.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hub_store::{Change, JsonFile, SharedClock};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::AuthMethod;
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// One external identity linked to a user: who the provider says they are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalIdentity {
    pub method: AuthMethod,
    /// Stable subject identifier issued by the provider.
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Provider-specific profile data carried through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub last_seen: DateTime<Utc>,
}

/// A persisted user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Manually assigned groups; the only durable group membership.
    #[serde(default)]
    pub internal_groups: Vec<String>,
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,
    #[serde(default)]
    pub identities: Vec<ExternalIdentity>,
    #[serde(default = "active_by_default")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_date: Option<DateTime<Utc>>,
}

fn active_by_default() -> bool {
    true
}

impl User {
    /// A fresh active user with no group assignments.
    pub fn new(username: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("user_{}", Uuid::now_v7().simple()),
            username: username.into(),
            email: None,
            name: None,
            internal_groups: Vec::new(),
            auth_methods: Vec::new(),
            identities: Vec::new(),
            active: true,
            created_at: now,
            updated_at: now,
            last_active_date: None,
        }
    }

    /// Whether `ident` names this user by username, email, or any linked subject.
    pub fn matches_identifier(&self, ident: &str) -> bool {
        self.username.eq_ignore_ascii_case(ident)
            || self
                .email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(ident))
            || self.identities.iter().any(|i| i.subject == ident)
    }

    pub fn identity(&self, method: AuthMethod) -> Option<&ExternalIdentity> {
        self.identities.iter().find(|i| i.method == method)
    }

    /// Insert or replace the identity block for `identity.method`.
    pub fn link_identity(&mut self, identity: ExternalIdentity) {
        let method = identity.method;
        match self.identities.iter_mut().find(|i| i.method == method) {
            Some(existing) => *existing = identity,
            None => self.identities.push(identity),
        }
        if !self.auth_methods.contains(&method) {
            self.auth_methods.push(method);
        }
    }

    pub fn has_internal_group(&self, group: &str) -> bool {
        self.internal_groups.iter().any(|g| g == group)
    }
}

/// The `users.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsersDocument {
    #[serde(default)]
    pub users: BTreeMap<String, User>,
}

// ═══════════════════════════════════════════════════════════════════════
//  UserStore
// ═══════════════════════════════════════════════════════════════════════

/// CRUD operations on user records.
#[derive(Clone)]
pub struct UserStore {
    file: JsonFile<UsersDocument>,
    clock: SharedClock,
}

impl UserStore {
    pub fn new(path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self {
            file: JsonFile::new(path),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Every user, ordered by id.
    pub async fn list(&self) -> Result<Vec<User>> {
        Ok(self.file.load().await?.users.into_values().collect())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<User>> {
        Ok(self.file.load().await?.users.remove(id))
    }

    /// Find a user by username, email (both case-insensitive), or any
    /// linked identity subject.
    #[instrument(skip(self))]
    pub async fn find_by_identifier(&self, ident: &str) -> Result<Option<User>> {
        let doc = self.file.load().await?;
        Ok(doc.users.into_values().find(|u| u.matches_identifier(ident)))
    }

    /// Insert or replace a user record as given.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn save(&self, user: User) -> Result<User> {
        let stored = user.clone();
        self.file
            .update(move |doc| {
                doc.users.insert(user.id.clone(), user);
                Change::Changed(())
            })
            .await?;
        debug!(user_id = %stored.id, "user saved");
        Ok(stored)
    }

    /// Mutate a user in place. Returns the updated record, or `None` when
    /// the user does not exist. `updatedAt` is refreshed.
    pub async fn update<F>(&self, id: &str, f: F) -> Result<Option<User>>
    where
        F: FnOnce(&mut User) + Send,
    {
        self.update_if(id, |_| true, f).await
    }

    /// Apply `f` to user `id` only if `allowed` accepts the current
    /// document. Both run under the file's write lock, so no other update
    /// can land between the check and the change.
    ///
    /// `None` when the user does not exist or `allowed` refused.
    pub async fn update_if<P, F>(&self, id: &str, allowed: P, f: F) -> Result<Option<User>>
    where
        P: FnOnce(&UsersDocument) -> bool + Send,
        F: FnOnce(&mut User) + Send,
    {
        let now = self.clock.now();
        let id = id.to_string();
        let updated = self
            .file
            .update(move |doc| {
                if !allowed(doc) {
                    return Change::Unchanged(None);
                }
                match doc.users.get_mut(&id) {
                    Some(user) => {
                        f(user);
                        user.updated_at = now;
                        Change::Changed(Some(user.clone()))
                    }
                    None => Change::Unchanged(None),
                }
            })
            .await?;
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let removed = self
            .file
            .update(move |doc| match doc.users.remove(&id) {
                Some(_) => Change::Changed(true),
                None => Change::Unchanged(false),
            })
            .await?;
        if removed {
            debug!("user deleted");
        }
        Ok(removed)
    }

    /// Stamp `lastActiveDate` with the current time.
    pub async fn record_login(&self, id: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .update(id, move |u| u.last_active_date = Some(now))
            .await?
            .is_some())
    }
}

impl std::fmt::Debug for UserStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserStore")
            .field("path", &self.file.path())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
