//! Persistent, rotating refresh tokens.
//!
//! Tokens are indexed by `SHA-256(token)` so a lookup never needs the
//! plaintext on disk; the entry additionally carries a bcrypt hash of the
//! token, which is the authoritative check. Every redemption deletes the
//! entry, so each token can be used once.
//!
//! File layout (`oauth-refresh-tokens.json`):
//!
//! ```json
//! { "tokens": { "<sha256 hex>": {
//!     "bcryptHash": "$2b$10$...", "clientId": "client_abc", "userId": "user_123",
//!     "scopes": ["openid"], "expiresAt": "2026-11-17T10:00:00Z" } } }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use hub_store::{Expiring, FileTtlStore, SharedClock, TtlStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::crypto::{TOKEN_BYTES, bcrypt_hash, bcrypt_verify, random_hex, sha256_hex};
use crate::error::Result;
use crate::lifetime;

/// Default refresh token lifetime.
pub const DEFAULT_REFRESH_TTL_DAYS: i64 = 30;

/// Context a refresh token grants when redeemed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenData {
    pub client_id: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    /// Session details needed to mint the next access token.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// Stored form: the context plus the bcrypt hash of the token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRefreshToken {
    pub bcrypt_hash: String,
    #[serde(flatten)]
    pub data: RefreshTokenData,
}

/// Refresh token registry.
pub struct RefreshTokenStore {
    tokens: Arc<dyn TtlStore<StoredRefreshToken>>,
    clock: SharedClock,
    ttl_days: i64,
}

impl RefreshTokenStore {
    /// File-backed store at `path`.
    pub fn open(path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        let tokens = FileTtlStore::new(path, "tokens", Arc::clone(&clock));
        Self::with_backend(Arc::new(tokens), clock)
    }

    pub fn with_backend(tokens: Arc<dyn TtlStore<StoredRefreshToken>>, clock: SharedClock) -> Self {
        Self {
            tokens,
            clock,
            ttl_days: DEFAULT_REFRESH_TTL_DAYS,
        }
    }

    /// Override the default lifetime used when none is given per token.
    pub fn with_ttl_days(mut self, days: i64) -> Self {
        self.ttl_days = days;
        self
    }

    /// A fresh 256-bit token, hex encoded.
    pub fn generate_refresh_token(&self) -> Result<String> {
        random_hex(TOKEN_BYTES)
    }

    /// Persist `token` bound to `data`. Expired entries are pruned on write.
    #[instrument(skip(self, token, data), fields(client_id = %data.client_id, user_id = %data.user_id))]
    pub async fn store_refresh_token(
        &self,
        token: &str,
        data: RefreshTokenData,
        ttl_days: Option<i64>,
    ) -> Result<()> {
        let ttl = lifetime::ttl_days(ttl_days.unwrap_or(self.ttl_days))?;
        let expires_at = lifetime::expiry(self.clock.now(), ttl)?;
        let stored = StoredRefreshToken {
            bcrypt_hash: bcrypt_hash(token.to_string()).await?,
            data,
        };
        self.tokens
            .put(&sha256_hex(token), Expiring::new(stored, expires_at))
            .await?;
        debug!(%expires_at, "refresh token stored");
        Ok(())
    }

    /// Redeem `token`, deleting it. Returns the bound context once.
    ///
    /// Expiry is checked before the bcrypt comparison. A bcrypt mismatch
    /// leaves the entry in place.
    #[instrument(skip(self, token))]
    pub async fn consume_refresh_token(&self, token: &str) -> Result<Option<RefreshTokenData>> {
        Ok(self
            .consume_refresh_token_with(token, |_| Ok(()))
            .await?
            .map(|(data, ())| data))
    }

    /// Redeem `token` only if `check` accepts its context.
    ///
    /// `check` runs after the token has been authenticated and before it is
    /// deleted. When it fails the error is returned and the token stays
    /// redeemable.
    pub async fn consume_refresh_token_with<T, F>(
        &self,
        token: &str,
        check: F,
    ) -> Result<Option<(RefreshTokenData, T)>>
    where
        F: FnOnce(&RefreshTokenData) -> Result<T>,
    {
        let key = sha256_hex(token);
        let Some(entry) = self.tokens.get(&key).await? else {
            debug!("refresh token not found");
            return Ok(None);
        };

        if entry.is_expired_at(self.clock.now()) {
            self.tokens.remove(&key).await?;
            debug!(client_id = %entry.value.data.client_id, "refresh token expired");
            return Ok(None);
        }

        if !bcrypt_verify(token.to_string(), entry.value.bcrypt_hash.clone()).await? {
            warn!(client_id = %entry.value.data.client_id, "refresh token hash mismatch");
            return Ok(None);
        }

        let accepted = check(&entry.value.data)?;

        // A concurrent redemption may have taken it since the lookup.
        match self.tokens.take(&key).await? {
            Some(taken) => Ok(Some((taken.value.data, accepted))),
            None => {
                warn!(client_id = %entry.value.data.client_id, "refresh token redeemed concurrently");
                Ok(None)
            }
        }
    }

    /// Revoke `token`. Unknown tokens are not an error (RFC 7009).
    #[instrument(skip(self, token))]
    pub async fn revoke_refresh_token(&self, token: &str) -> Result<bool> {
        let removed = self.tokens.remove(&sha256_hex(token)).await?;
        if removed {
            debug!("refresh token revoked");
        }
        Ok(removed)
    }

    /// Revoke every token issued to `client_id`.
    pub async fn revoke_for_client(&self, client_id: &str) -> Result<usize> {
        let removed = self
            .tokens
            .remove_where(&|_, e| e.value.data.client_id == client_id)
            .await?;
        if removed > 0 {
            info!(client_id, removed, "refresh tokens revoked for client");
        }
        Ok(removed)
    }

    /// Revoke every token issued on behalf of `user_id`.
    pub async fn revoke_for_user(&self, user_id: &str) -> Result<usize> {
        let removed = self
            .tokens
            .remove_where(&|_, e| e.value.data.user_id == user_id)
            .await?;
        if removed > 0 {
            info!(user_id, removed, "refresh tokens revoked for user");
        }
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.tokens.len().await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
