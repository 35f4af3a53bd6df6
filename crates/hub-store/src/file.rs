//! Whole-document JSON files with atomic replacement.
//!
//! Every persisted identity store (users, clients, refresh tokens, consent)
//! follows the same discipline: read the whole file, mutate in memory, write
//! a temp file next to the target and rename it over the original. A rename
//! within one directory is atomic, so readers never observe a half-written
//! document.
//!
//! [`JsonFile::update`] serialises read-modify-write cycles on the same
//! handle through an async mutex. There is no cross-process coordination:
//! two server processes writing the same file can lose updates.

use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument};

use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Atomic write primitive
// ---------------------------------------------------------------------------

/// Write `bytes` to `path` via a temp file in the same directory + rename.
///
/// Parent directories are created on demand.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(|e| StoreError::io(&parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| StoreError::io(&parent, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;

    debug!(path = %path.display(), bytes = bytes.len(), "atomic write complete");
    Ok(())
}

/// Like [`write_atomic`], then restrict the file to its owner (0600 on Unix).
///
/// Used for generated key material.
pub fn write_private(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    write_atomic(path, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(|e| StoreError::io(path, e))?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// JsonFile
// ---------------------------------------------------------------------------

/// Result of a mutation closure passed to [`JsonFile::update`].
#[derive(Debug)]
pub enum Change<R> {
    /// The document was modified and must be written back.
    Changed(R),
    /// Nothing changed; skip the write.
    Unchanged(R),
}

impl<R> Change<R> {
    fn into_parts(self) -> (R, bool) {
        match self {
            Self::Changed(r) => (r, true),
            Self::Unchanged(r) => (r, false),
        }
    }
}

/// A JSON document persisted as a single file.
///
/// Cloning the handle shares the write lock, so clones cooperate.
pub struct JsonFile<T> {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonFile<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            lock: Arc::clone(&self.lock),
            _marker: PhantomData,
        }
    }
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
{
    /// Create a handle for the document at `path`. The file need not exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
            _marker: PhantomData,
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. A missing or empty file yields `T::default()`.
    pub async fn load(&self) -> StoreResult<T> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_document(&path)).await?
    }

    /// Replace the document on disk.
    pub async fn save(&self, doc: &T) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        self.write(doc).await
    }

    /// Read, mutate, and (if the closure reports a change) write back the
    /// document while holding this handle's write lock.
    #[instrument(skip(self, f), fields(path = %self.path.display()))]
    pub async fn update<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut T) -> Change<R> + Send,
        R: Send,
    {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let (result, changed) = f(&mut doc).into_parts();
        if changed {
            self.write(&doc).await?;
        }
        Ok(result)
    }

    async fn write(&self, doc: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let path = self.path.clone();
        let outcome = tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await?;
        if let Err(ref err) = outcome {
            error!(path = %self.path.display(), %err, "failed to persist document");
        }
        outcome
    }
}

fn read_document<T>(path: &Path) -> StoreResult<T>
where
    T: DeserializeOwned + Default,
{
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }

    serde_json::from_slice(&bytes).map_err(|e| StoreError::MalformedDocument {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        items: BTreeMap<String, u32>,
    }

    #[tokio::test]
    async fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let file: JsonFile<Doc> = JsonFile::new(dir.path().join("absent.json"));
        assert_eq!(file.load().await.unwrap(), Doc::default());
    }

    #[tokio::test]
    async fn update_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file: JsonFile<Doc> = JsonFile::new(dir.path().join("doc.json"));

        file.update(|doc| {
            doc.items.insert("a".into(), 1);
            Change::Changed(())
        })
        .await
        .unwrap();

        let reopened: JsonFile<Doc> = JsonFile::new(dir.path().join("doc.json"));
        let doc = reopened.load().await.unwrap();
        assert_eq!(doc.items.get("a"), Some(&1));
    }

    #[tokio::test]
    async fn unchanged_update_does_not_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let file: JsonFile<Doc> = JsonFile::new(&path);

        let len = file
            .update(|doc| Change::Unchanged(doc.items.len()))
            .await
            .unwrap();
        assert_eq!(len, 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let file: JsonFile<Doc> = JsonFile::new(&path);
        let err = file.load().await.unwrap_err();
        assert!(matches!(err, StoreError::MalformedDocument { .. }));
    }

    #[test]
    fn write_atomic_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("x.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
    }

    #[cfg(unix)]
    #[test]
    fn write_private_restricts_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        write_private(&path, b"k").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
