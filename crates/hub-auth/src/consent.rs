//! Per-client, per-user consent records (`oauth-consent.json`).
//!
//! A record is keyed `clientId:userId`. A request is covered when every
//! requested scope was granted and the record has not expired; a stored
//! superset covers a narrower request.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hub_store::{Expiring, FileTtlStore, SharedClock, TtlStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::lifetime;

/// Default consent lifetime.
pub const DEFAULT_CONSENT_TTL_DAYS: i64 = 90;

/// A stored consent grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    pub scopes: Vec<String>,
    pub granted_at: DateTime<Utc>,
}

/// A consent grant with its identifiers, as listed for a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentEntry {
    pub client_id: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

fn consent_key(client_id: &str, user_id: &str) -> String {
    format!("{client_id}:{user_id}")
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

/// Consent registry.
pub struct ConsentStore {
    consents: Arc<dyn TtlStore<ConsentRecord>>,
    clock: SharedClock,
}

impl ConsentStore {
    pub fn open(path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        let consents = FileTtlStore::new(path, "consents", Arc::clone(&clock));
        Self::with_backend(Arc::new(consents), clock)
    }

    pub fn with_backend(consents: Arc<dyn TtlStore<ConsentRecord>>, clock: SharedClock) -> Self {
        Self { consents, clock }
    }

    /// Whether `user_id` has consented to every scope in `scopes` for
    /// `client_id`.
    ///
    /// `_ttl_days` is accepted for call-site compatibility and ignored; the
    /// stored expiry alone decides.
    #[instrument(skip(self, scopes, _ttl_days))]
    pub async fn has_consent(
        &self,
        client_id: &str,
        user_id: &str,
        scopes: &[String],
        _ttl_days: Option<i64>,
    ) -> Result<bool> {
        let Some(entry) = self.consents.get(&consent_key(client_id, user_id)).await? else {
            return Ok(false);
        };
        if entry.is_expired_at(self.clock.now()) {
            debug!("consent expired");
            return Ok(false);
        }
        let granted: BTreeSet<&str> = entry.value.scopes.iter().map(String::as_str).collect();
        Ok(scopes.iter().all(|s| granted.contains(s.as_str())))
    }

    /// Record consent, replacing any earlier record and restarting its
    /// lifetime. Other expired records are pruned by the write.
    #[instrument(skip(self, scopes))]
    pub async fn grant_consent(
        &self,
        client_id: &str,
        user_id: &str,
        scopes: &[String],
        ttl_days: Option<i64>,
    ) -> Result<()> {
        let now = self.clock.now();
        let ttl = lifetime::ttl_days(ttl_days.unwrap_or(DEFAULT_CONSENT_TTL_DAYS))?;
        let expires_at = lifetime::expiry(now, ttl)?;
        let record = ConsentRecord {
            scopes: scopes.to_vec(),
            granted_at: now,
        };
        self.consents
            .put(&consent_key(client_id, user_id), Expiring::new(record, expires_at))
            .await?;
        info!(client_id, user_id, scopes = scopes.len(), "consent granted");
        Ok(())
    }

    /// Delete the record. Returns whether one existed.
    #[instrument(skip(self))]
    pub async fn revoke_consent(&self, client_id: &str, user_id: &str) -> Result<bool> {
        let removed = self.consents.remove(&consent_key(client_id, user_id)).await?;
        if removed {
            info!(client_id, user_id, "consent revoked");
        }
        Ok(removed)
    }

    /// Unexpired grants held by `user_id`.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConsentEntry>> {
        let now = self.clock.now();
        let entries = self.consents.entries().await?;
        Ok(entries
            .into_iter()
            .filter(|(_, e)| !e.is_expired_at(now))
            .filter_map(|(key, e)| {
                let (client, user) = split_key(&key)?;
                (user == user_id).then(|| ConsentEntry {
                    client_id: client.to_string(),
                    user_id: user.to_string(),
                    scopes: e.value.scopes,
                    granted_at: e.value.granted_at,
                    expires_at: e.expires_at,
                })
            })
            .collect())
    }

    /// Drop every grant made to `client_id`.
    pub async fn revoke_for_client(&self, client_id: &str) -> Result<usize> {
        let removed = self
            .consents
            .remove_where(&|key, _| split_key(key).is_some_and(|(c, _)| c == client_id))
            .await?;
        if removed > 0 {
            info!(client_id, removed, "consents revoked for client");
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
