//! Persistent key-value storage backing the vault and verifier.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage document is corrupt: {0}")]
    Corrupt(String),
}

/// Byte-oriented key-value storage.
///
/// `put` must overwrite a single key atomically and `remove_batch` must
/// remove all listed keys or none of them.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn remove_batch(&self, keys: &[&str]) -> Result<(), StoreError>;

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }
}

/// In-process store, for tests and embedders that persist elsewhere
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }

    fn remove_batch(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}

/// Single JSON document on disk.
///
/// Every mutation rewrites the whole document to a temp file and renames it
/// over the original, so readers only ever see a complete old or new state.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read(&self.path)?;
        if contents.is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&contents).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn write_document(&self, document: &BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let contents =
            serde_json::to_vec(document).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&contents)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), keys = document.len(), "Store document written");
        Ok(())
    }

    fn mutate(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> bool,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document = self.read_document()?;
        if apply(&mut document) {
            self.write_document(&document)?;
        }
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_document()?.remove(key))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.mutate(|doc| {
            doc.insert(key.to_string(), value.to_vec());
            true
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.mutate(|doc| doc.remove(key).is_some())
    }

    fn remove_batch(&self, keys: &[&str]) -> Result<(), StoreError> {
        self.mutate(|doc| {
            let mut changed = false;
            for key in keys {
                changed |= doc.remove(*key).is_some();
            }
            changed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip_and_remove() {
        let store = MemoryStore::new();
        store.put("a", b"1").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        // Removing again is fine
        store.remove("a").unwrap();
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store = FileStore::new(&path).unwrap();
        store.put("session", &[0, 1, 2, 255]).unwrap();
        drop(store);

        let reopened = FileStore::new(&path).unwrap();
        assert_eq!(reopened.get("session").unwrap(), Some(vec![0, 1, 2, 255]));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_file_store_batch_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("store.json")).unwrap();
        store.put("a", b"1").unwrap();
        store.put("b", b"2").unwrap();
        store.put("c", b"3").unwrap();

        store.remove_batch(&["a", "b", "missing"]).unwrap();

        assert!(!store.contains("a").unwrap());
        assert!(!store.contains("b").unwrap());
        assert!(store.contains("c").unwrap());
    }

    #[test]
    fn test_file_store_reports_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, b"{not json").unwrap();

        let store = FileStore::new(&path).unwrap();
        assert!(matches!(store.get("a"), Err(StoreError::Corrupt(_))));
    }
}
