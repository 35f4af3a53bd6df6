//! Key-value storage with per-entry expiry.
//!
//! The OAuth stores (authorization codes, refresh tokens, consent records)
//! share one shape: a string key mapping to a value that stops being valid
//! at `expires_at`. [`TtlStore`] captures that shape so the same store logic
//! can run against process memory ([`MemoryTtlStore`]) or a JSON file on
//! disk ([`FileTtlStore`]), or any shared backend implementing the trait.
//!
//! Backends return expired entries from [`TtlStore::get`] unchanged; the
//! caller decides whether an expired hit is deleted, logged, or ignored.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::clock::SharedClock;
use crate::error::StoreResult;
use crate::file::{Change, JsonFile};

// ---------------------------------------------------------------------------
// Entry type
// ---------------------------------------------------------------------------

/// A stored value with its expiry instant.
///
/// The value's fields are flattened next to `expiresAt` in the JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expiring<V> {
    #[serde(flatten)]
    pub value: V,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
}

impl<V> Expiring<V> {
    pub fn new(value: V, expires_at: DateTime<Utc>) -> Self {
        Self { value, expires_at }
    }

    /// `true` once `now` has reached the expiry instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Predicate used by [`TtlStore::remove_where`].
pub type EntryFilter<'a, V> = &'a (dyn Fn(&str, &Expiring<V>) -> bool + Send + Sync);

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A string-keyed store of expiring values.
#[async_trait]
pub trait TtlStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Fetch an entry without removing it, expired or not.
    async fn get(&self, key: &str) -> StoreResult<Option<Expiring<V>>>;

    /// Insert or overwrite an entry.
    async fn put(&self, key: &str, entry: Expiring<V>) -> StoreResult<()>;

    /// Remove an entry and return it. Of two concurrent `take` calls for the
    /// same key, at most one observes `Some`.
    async fn take(&self, key: &str) -> StoreResult<Option<Expiring<V>>>;

    /// Remove an entry, reporting whether it existed.
    async fn remove(&self, key: &str) -> StoreResult<bool>;

    /// Remove every entry matching `filter`, returning how many were removed.
    async fn remove_where(&self, filter: EntryFilter<'_, V>) -> StoreResult<usize>;

    /// Remove every entry that has expired at `now`.
    async fn prune_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Snapshot of all entries.
    async fn entries(&self) -> StoreResult<Vec<(String, Expiring<V>)>>;

    /// Number of stored entries, expired ones included.
    async fn len(&self) -> StoreResult<usize>;

    async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Process-local store backed by a concurrent hash map.
///
/// Contents vanish with the process.
pub struct MemoryTtlStore<V> {
    entries: DashMap<String, Expiring<V>>,
}

impl<V> Default for MemoryTtlStore<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V> MemoryTtlStore<V> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<V> TtlStore<V> for MemoryTtlStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> StoreResult<Option<Expiring<V>>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, key: &str, entry: Expiring<V>) -> StoreResult<()> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn take(&self, key: &str) -> StoreResult<Option<Expiring<V>>> {
        Ok(self.entries.remove(key).map(|(_, entry)| entry))
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn remove_where(&self, filter: EntryFilter<'_, V>) -> StoreResult<usize> {
        let before = self.entries.len();
        self.entries.retain(|k, v| !filter(k, v));
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired_at(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "pruned expired in-memory entries");
        }
        Ok(removed)
    }

    async fn entries(&self) -> StoreResult<Vec<(String, Expiring<V>)>> {
        Ok(self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.entries.len())
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

type Document<V> = BTreeMap<String, BTreeMap<String, Expiring<V>>>;

/// Store persisted as `{ "<root>": { key: entry, ... } }` in a JSON file.
///
/// Every [`put`](TtlStore::put) first prunes all entries that have expired
/// according to the store's clock, then writes the document atomically.
pub struct FileTtlStore<V> {
    file: JsonFile<Document<V>>,
    root: &'static str,
    clock: SharedClock,
}

impl<V> FileTtlStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open a store at `path` whose entries live under the `root` key.
    pub fn new(path: impl Into<PathBuf>, root: &'static str, clock: SharedClock) -> Self {
        Self {
            file: JsonFile::new(path),
            root,
            clock,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }

    async fn read_entries(&self) -> StoreResult<BTreeMap<String, Expiring<V>>> {
        let mut doc = self.file.load().await?;
        Ok(doc.remove(self.root).unwrap_or_default())
    }
}

fn prune<V>(entries: &mut BTreeMap<String, Expiring<V>>, now: DateTime<Utc>) -> usize {
    let before = entries.len();
    entries.retain(|_, v| !v.is_expired_at(now));
    before - entries.len()
}

#[async_trait]
impl<V> TtlStore<V> for FileTtlStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> StoreResult<Option<Expiring<V>>> {
        let mut entries = self.read_entries().await?;
        Ok(entries.remove(key))
    }

    #[instrument(skip(self, entry), fields(root = self.root))]
    async fn put(&self, key: &str, entry: Expiring<V>) -> StoreResult<()> {
        let now = self.clock.now();
        let root = self.root;
        let key = key.to_string();
        let pruned = self
            .file
            .update(move |doc| {
                let entries = doc.entry(root.to_string()).or_default();
                let pruned = prune(entries, now);
                entries.insert(key, entry);
                Change::Changed(pruned)
            })
            .await?;
        if pruned > 0 {
            debug!(root = self.root, pruned, "pruned expired entries on write");
        }
        Ok(())
    }

    async fn take(&self, key: &str) -> StoreResult<Option<Expiring<V>>> {
        let root = self.root;
        self.file
            .update(move |doc| {
                match doc.get_mut(root).and_then(|entries| entries.remove(key)) {
                    Some(entry) => Change::Changed(Some(entry)),
                    None => Change::Unchanged(None),
                }
            })
            .await
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        Ok(self.take(key).await?.is_some())
    }

    async fn remove_where(&self, filter: EntryFilter<'_, V>) -> StoreResult<usize> {
        let root = self.root;
        self.file
            .update(move |doc| {
                let Some(entries) = doc.get_mut(root) else {
                    return Change::Unchanged(0);
                };
                let before = entries.len();
                entries.retain(|k, v| !filter(k, v));
                let removed = before - entries.len();
                if removed > 0 {
                    Change::Changed(removed)
                } else {
                    Change::Unchanged(0)
                }
            })
            .await
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let root = self.root;
        self.file
            .update(move |doc| {
                let Some(entries) = doc.get_mut(root) else {
                    return Change::Unchanged(0);
                };
                match prune(entries, now) {
                    0 => Change::Unchanged(0),
                    n => Change::Changed(n),
                }
            })
            .await
    }

    async fn entries(&self) -> StoreResult<Vec<(String, Expiring<V>)>> {
        Ok(self.read_entries().await?.into_iter().collect())
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.read_entries().await?.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Grant {
        user_id: String,
    }

    fn grant(user: &str) -> Grant {
        Grant {
            user_id: user.to_string(),
        }
    }

    #[tokio::test]
    async fn memory_take_is_single_use() {
        let store: MemoryTtlStore<Grant> = MemoryTtlStore::new();
        let exp = Utc::now() + Duration::minutes(5);
        store.put("k", Expiring::new(grant("u1"), exp)).await.unwrap();

        assert!(store.take("k").await.unwrap().is_some());
        assert!(store.take("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_prune_removes_only_expired() {
        let store: MemoryTtlStore<Grant> = MemoryTtlStore::new();
        let now = Utc::now();
        store
            .put("old", Expiring::new(grant("a"), now - Duration::seconds(1)))
            .await
            .unwrap();
        store
            .put("new", Expiring::new(grant("b"), now + Duration::minutes(1)))
            .await
            .unwrap();

        assert_eq!(store.prune_expired(now).await.unwrap(), 1);
        assert!(store.get("new").await.unwrap().is_some());
        assert!(store.get("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_put_prunes_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let store: FileTtlStore<Grant> =
            FileTtlStore::new(dir.path().join("t.json"), "tokens", Arc::new(clock.clone()));

        let now = clock.now();
        store
            .put("a", Expiring::new(grant("a"), now + Duration::minutes(1)))
            .await
            .unwrap();
        clock.advance(Duration::minutes(2));
        store
            .put("b", Expiring::new(grant("b"), clock.now() + Duration::minutes(1)))
            .await
            .unwrap();

        let keys: Vec<String> = store.entries().await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn file_layout_flattens_value_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consent.json");
        let store: FileTtlStore<Grant> =
            FileTtlStore::new(&path, "consents", crate::clock::system_clock());
        let exp = Utc::now() + Duration::days(1);
        store.put("c:u", Expiring::new(grant("u"), exp)).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let entry = &raw["consents"]["c:u"];
        assert_eq!(entry["userId"], "u");
        assert!(entry["expiresAt"].is_string());
    }

    #[tokio::test]
    async fn file_remove_where_matches_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let store: FileTtlStore<Grant> = FileTtlStore::new(
            dir.path().join("t.json"),
            "tokens",
            crate::clock::system_clock(),
        );
        let exp = Utc::now() + Duration::days(1);
        store.put("1", Expiring::new(grant("alice"), exp)).await.unwrap();
        store.put("2", Expiring::new(grant("bob"), exp)).await.unwrap();
        store.put("3", Expiring::new(grant("alice"), exp)).await.unwrap();

        let removed = store
            .remove_where(&|_, e| e.value.user_id == "alice")
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn file_remove_missing_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let store: FileTtlStore<Grant> = FileTtlStore::new(
            dir.path().join("t.json"),
            "tokens",
            crate::clock::system_clock(),
        );
        assert!(!store.remove("nope").await.unwrap());
    }
}
