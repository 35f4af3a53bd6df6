//! Short-lived, single-use authorization codes.
//!
//! Codes live in memory for the lifetime of the process; a restart
//! invalidates every outstanding code. Consumption removes the entry
//! atomically, so of two concurrent redemptions exactly one wins.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use hub_store::{Expiring, MemoryTtlStore, SharedClock, Sweeper, TtlStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::crypto::{TOKEN_BYTES, random_hex};
use crate::error::Result;

/// Lifetime of an authorization code.
pub const CODE_TTL_MINUTES: i64 = 10;

/// Interval of the background expiry sweep.
pub const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(5 * 60);

/// Everything an authorization code is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationCodeData {
    pub client_id: String,
    pub redirect_uri: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Session details needed to mint the access token on exchange.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// Stored form of a code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCode {
    #[serde(flatten)]
    pub data: AuthorizationCodeData,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

/// In-memory authorization code registry.
pub struct AuthorizationCodeStore {
    codes: Arc<dyn TtlStore<StoredCode>>,
    clock: SharedClock,
}

impl AuthorizationCodeStore {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_backend(Arc::new(MemoryTtlStore::new()), clock)
    }

    /// Use a different backend, e.g. one shared between instances.
    pub fn with_backend(codes: Arc<dyn TtlStore<StoredCode>>, clock: SharedClock) -> Self {
        Self { codes, clock }
    }

    /// A fresh 256-bit code, hex encoded.
    pub fn generate_code(&self) -> Result<String> {
        random_hex(TOKEN_BYTES)
    }

    /// Bind `data` to `code` for [`CODE_TTL_MINUTES`].
    #[instrument(skip(self, code, data), fields(client_id = %data.client_id))]
    pub async fn store_code(&self, code: &str, data: AuthorizationCodeData) -> Result<()> {
        let now = self.clock.now();
        let expires_at = now + Duration::minutes(CODE_TTL_MINUTES);
        let stored = StoredCode {
            data,
            used: false,
            created_at: now,
        };
        self.codes.put(code, Expiring::new(stored, expires_at)).await?;
        debug!(%expires_at, "authorization code stored");
        Ok(())
    }

    /// Redeem `code`. Returns the bound data at most once.
    ///
    /// Unknown, replayed, and expired codes all yield `None`; the entry is
    /// gone afterwards in every case.
    #[instrument(skip(self, code))]
    pub async fn consume_code(&self, code: &str) -> Result<Option<AuthorizationCodeData>> {
        let Some(entry) = self.codes.take(code).await? else {
            debug!("authorization code not found");
            return Ok(None);
        };

        if entry.value.used {
            warn!(client_id = %entry.value.data.client_id, "authorization code replay attempt");
            return Ok(None);
        }
        if entry.is_expired_at(self.clock.now()) {
            debug!(client_id = %entry.value.data.client_id, "authorization code expired");
            return Ok(None);
        }

        Ok(Some(entry.value.data))
    }

    /// Number of outstanding codes, expired ones included until swept.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.codes.len().await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove expired codes now.
    pub async fn prune_expired(&self) -> Result<usize> {
        Ok(self.codes.prune_expired(self.clock.now()).await?)
    }

    /// Start the periodic expiry sweep. Dropping or shutting down the
    /// returned handle stops it.
    pub fn spawn_sweeper(&self) -> Sweeper {
        Sweeper::spawn(
            "authorization-codes",
            Arc::clone(&self.codes),
            Arc::clone(&self.clock),
            SWEEP_INTERVAL,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use hub_store::{Clock, ManualClock};

    use super::*;

    fn data() -> AuthorizationCodeData {
        AuthorizationCodeData {
            client_id: "client_abc".into(),
            redirect_uri: "https://app.example.com/cb".into(),
            user_id: "user_123".into(),
            scopes: vec!["openid".into()],
            code_challenge: Some("challenge".into()),
            code_challenge_method: Some("S256".into()),
            nonce: None,
            context: serde_json::Map::new(),
        }
    }

    fn store() -> (AuthorizationCodeStore, ManualClock) {
        let clock = ManualClock::starting_now();
        (AuthorizationCodeStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn code_is_single_use() {
        let (store, _) = store();
        let code = store.generate_code().unwrap();
        assert_eq!(code.len(), 64);
        store.store_code(&code, data()).await.unwrap();

        assert_eq!(store.consume_code(&code).await.unwrap(), Some(data()));
        assert_eq!(store.consume_code(&code).await.unwrap(), None);
    }

    #[tokio::test]
    async fn code_expires_after_ten_minutes() {
        let (store, clock) = store();
        store.store_code("c", data()).await.unwrap();
        clock.advance(Duration::minutes(11));
        assert_eq!(store.consume_code("c").await.unwrap(), None);
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn code_valid_just_before_expiry() {
        let (store, clock) = store();
        store.store_code("c", data()).await.unwrap();
        clock.advance(Duration::minutes(9));
        assert!(store.consume_code("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn used_flag_is_treated_as_replay() {
        let clock = ManualClock::starting_now();
        let backend: Arc<MemoryTtlStore<StoredCode>> = Arc::new(MemoryTtlStore::new());
        let store = AuthorizationCodeStore::with_backend(backend.clone(), Arc::new(clock.clone()));

        let stored = StoredCode {
            data: data(),
            used: true,
            created_at: clock.now(),
        };
        backend
            .put("c", Expiring::new(stored, clock.now() + Duration::minutes(5)))
            .await
            .unwrap();

        assert_eq!(store.consume_code("c").await.unwrap(), None);
        assert!(backend.get("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_consumers_get_one_payload() {
        let (store, _) = store();
        let store = Arc::new(store);
        store.store_code("race", data()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.consume_code("race").await.unwrap() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_prunes_expired_codes() {
        let (store, clock) = store();
        store.store_code("old", data()).await.unwrap();
        let sweeper = store.spawn_sweeper();

        clock.advance(Duration::minutes(11));
        tokio::time::sleep(SWEEP_INTERVAL + StdDuration::from_secs(1)).await;
        assert!(store.is_empty().await.unwrap());

        sweeper.shutdown().await;
    }
}
