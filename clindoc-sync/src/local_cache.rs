//! Key-partitioned local persistence
//!
//! Reads and writes are synchronous: callers hold the controller's state lock
//! while persisting, and nothing here ever yields to the runtime. Values are
//! JSON documents; collections keep their order.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};

/// Storage partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Patients,
    Episodes,
    Encounters,
    Notes,
    Profile,
    Reports,
    /// Pending → confirmed id map
    Aliases,
}

impl CacheKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKey::Patients => "patients",
            CacheKey::Episodes => "episodes",
            CacheKey::Encounters => "encounters",
            CacheKey::Notes => "notes",
            CacheKey::Profile => "profile",
            CacheKey::Reports => "reports",
            CacheKey::Aliases => "aliases",
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw string storage behind [`LocalCacheStore`]
pub trait CacheBackend: Send + Sync {
    /// # Errors
    ///
    /// `Cache` on I/O failure. A missing key is `Ok(None)`.
    fn read(&self, key: &str) -> SyncResult<Option<String>>;

    /// # Errors
    ///
    /// `Cache` on I/O failure.
    fn write(&self, key: &str, value: &str) -> SyncResult<()>;

    /// # Errors
    ///
    /// `Cache` on I/O failure. Removing a missing key succeeds.
    fn remove(&self, key: &str) -> SyncResult<()>;

    /// # Errors
    ///
    /// `Cache` on I/O failure.
    fn keys(&self) -> SyncResult<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn read(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> SyncResult<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> SyncResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// One `<key>.json` file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Open (and create if needed) the cache directory.
    ///
    /// # Errors
    ///
    /// `Cache` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| SyncError::Cache(format!("{}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> SyncResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SyncError::Cache(format!("invalid cache key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl CacheBackend for FileBackend {
    fn read(&self, key: &str) -> SyncResult<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Cache(format!("{}: {e}", path.display()))),
        }
    }

    fn write(&self, key: &str, value: &str) -> SyncResult<()> {
        let path = self.path_for(key)?;
        let tmp = self.dir.join(format!(".{key}.json.tmp"));

        // Write-then-rename so a crash never leaves a truncated document
        let mut file = fs::File::create(&tmp)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path).map_err(|e| SyncError::Cache(format!("{}: {e}", path.display())))
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Cache(format!("{}: {e}", path.display()))),
        }
    }

    fn keys(&self) -> SyncResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if !stem.starts_with('.') {
                        keys.push(stem.to_string());
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Typed access to the cache partitions
#[derive(Clone)]
pub struct LocalCacheStore {
    backend: Arc<dyn CacheBackend>,
}

impl fmt::Debug for LocalCacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCacheStore").finish_non_exhaustive()
    }
}

impl LocalCacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// # Errors
    ///
    /// See [`FileBackend::open`].
    pub fn in_dir(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        Ok(Self::new(Arc::new(FileBackend::open(dir)?)))
    }

    fn load<T: DeserializeOwned>(&self, key: CacheKey) -> SyncResult<Option<T>> {
        match self.backend.read(key.as_str())? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| SyncError::Cache(format!("corrupt {key} entry: {e}"))),
            None => Ok(None),
        }
    }

    fn store<T: Serialize + ?Sized>(&self, key: CacheKey, value: &T) -> SyncResult<()> {
        let raw = serde_json::to_string(value)?;
        self.backend.write(key.as_str(), &raw)
    }

    /// # Errors
    ///
    /// `Cache` on I/O failure or a corrupt document.
    pub fn load_collection<T: DeserializeOwned>(&self, key: CacheKey) -> SyncResult<Vec<T>> {
        Ok(self.load(key)?.unwrap_or_default())
    }

    /// # Errors
    ///
    /// `Cache` on I/O failure.
    pub fn save_collection<T: Serialize>(&self, key: CacheKey, items: &[T]) -> SyncResult<()> {
        self.store(key, items)
    }

    /// # Errors
    ///
    /// `Cache` on I/O failure or a corrupt document.
    pub fn load_map<V: DeserializeOwned>(&self, key: CacheKey) -> SyncResult<BTreeMap<String, V>> {
        Ok(self.load(key)?.unwrap_or_default())
    }

    /// # Errors
    ///
    /// `Cache` on I/O failure.
    pub fn save_map<V: Serialize>(&self, key: CacheKey, map: &BTreeMap<String, V>) -> SyncResult<()> {
        self.store(key, map)
    }

    /// # Errors
    ///
    /// `Cache` on I/O failure or a corrupt document.
    pub fn load_blob(&self, key: CacheKey) -> SyncResult<Option<Value>> {
        self.load(key)
    }

    /// # Errors
    ///
    /// `Cache` on I/O failure.
    pub fn save_blob(&self, key: CacheKey, value: &Value) -> SyncResult<()> {
        self.store(key, value)
    }

    /// # Errors
    ///
    /// `Cache` on I/O failure.
    pub fn clear(&self, key: CacheKey) -> SyncResult<()> {
        self.backend.remove(key.as_str())
    }

    /// Keys currently holding a document
    ///
    /// # Errors
    ///
    /// `Cache` on I/O failure.
    pub fn stored_keys(&self) -> SyncResult<Vec<String>> {
        self.backend.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_missing_keys_load_empty() {
        let store = LocalCacheStore::in_memory();
        assert!(store.load_collection::<Value>(CacheKey::Patients).unwrap().is_empty());
        assert!(store.load_map::<Value>(CacheKey::Notes).unwrap().is_empty());
        assert!(store.load_blob(CacheKey::Profile).unwrap().is_none());
    }

    #[test]
    fn test_file_backend_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let store = LocalCacheStore::in_dir(dir.path()).unwrap();
        store
            .save_collection(CacheKey::Episodes, &[json!({"n": 1}), json!({"n": 2})])
            .unwrap();

        let reopened = LocalCacheStore::in_dir(dir.path()).unwrap();
        let items: Vec<Value> = reopened.load_collection(CacheKey::Episodes).unwrap();
        assert_eq!(items, vec![json!({"n": 1}), json!({"n": 2})]);
        assert!(dir.path().join("episodes.json").exists());
        assert!(!dir.path().join(".episodes.json.tmp").exists());
    }

    #[test]
    fn test_file_backend_keys_and_remove() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.write("notes", "{}").unwrap();
        backend.write("profile", "null").unwrap();
        assert_eq!(backend.keys().unwrap(), vec!["notes".to_string(), "profile".to_string()]);

        backend.remove("notes").unwrap();
        backend.remove("notes").unwrap();
        assert_eq!(backend.read("notes").unwrap(), None);
    }

    #[test]
    fn test_file_backend_rejects_path_like_keys() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        assert!(matches!(backend.write("../escape", "{}"), Err(SyncError::Cache(_))));
    }

    #[test]
    fn test_corrupt_document_is_a_cache_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write("patients", "[{").unwrap();
        let store = LocalCacheStore::new(backend);
        assert!(matches!(
            store.load_collection::<Value>(CacheKey::Patients),
            Err(SyncError::Cache(_))
        ));
    }
}
