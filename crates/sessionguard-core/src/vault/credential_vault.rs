use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::cipher::VaultEntry;
use super::keys::KeyProvider;
use super::legacy::{self, LegacySession, LEGACY_KEYS};
use super::store::KeyValueStore;
use crate::error::SessionError;
use crate::models::SessionRecord;

/// Store key of the encrypted session blob
pub const SESSION_BLOB_KEY: &str = "session.vault";

/// Encrypted persistence boundary for session credentials.
///
/// Holds no decrypted copy of its own: plaintext exists only in zeroizing
/// buffers for the duration of a call.
pub struct CredentialVault {
    store: Arc<dyn KeyValueStore>,
    keys: Arc<dyn KeyProvider>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: Arc<dyn KeyProvider>) -> Self {
        Self { store, keys }
    }

    /// Encrypt and atomically overwrite the stored session.
    ///
    /// On any failure the previously stored blob is left untouched. A missing
    /// key reports `KeyUnavailable`, other encryption errors `CryptoFailure`;
    /// both answer `is_crypto_failure`.
    pub fn persist(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(record).map_err(|e| SessionError::CryptoFailure(e.to_string()))?,
        );
        let key = self
            .keys
            .get_or_create_key()
            .map_err(|e| SessionError::KeyUnavailable(e.to_string()))?;
        let entry =
            VaultEntry::seal(&key, &plaintext).map_err(SessionError::CryptoFailure)?;

        self.store
            .put(SESSION_BLOB_KEY, &entry.encode())
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        debug!(key_ref = entry.key_ref(), "Session persisted");
        Ok(())
    }

    /// Load the stored session, migrating the legacy layout first if present.
    ///
    /// Anything unreadable is reported as no session.
    pub fn load(&self) -> Option<SessionRecord> {
        match legacy::is_present(self.store.as_ref()) {
            Ok(true) => return self.migrate_legacy(),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to probe legacy session layout"),
        }

        match self.read_current() {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Stored session unreadable, treating as absent");
                None
            }
        }
    }

    /// Remove the stored session. Idempotent.
    pub fn clear(&self) -> Result<(), SessionError> {
        self.store
            .remove(SESSION_BLOB_KEY)
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        debug!("Session blob cleared");
        Ok(())
    }

    /// Whether an encrypted blob is stored (readable or not)
    pub fn has_stored_session(&self) -> bool {
        self.store.contains(SESSION_BLOB_KEY).unwrap_or(false)
    }

    fn read_current(&self) -> Result<Option<SessionRecord>, String> {
        let bytes = match self.store.get(SESSION_BLOB_KEY).map_err(|e| e.to_string())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let entry = VaultEntry::decode(&bytes)?;
        let key = self.keys.key_for(entry.key_ref()).map_err(|e| e.to_string())?;
        let plaintext = entry.open(&key)?;
        serde_json::from_slice(&plaintext)
            .map(Some)
            .map_err(|e| format!("decrypted session is malformed: {}", e))
    }

    /// Move a legacy session into the encrypted layout.
    ///
    /// Legacy keys are only deleted once the encrypted copy has been written
    /// and read back equal; any earlier failure leaves them for the next load.
    fn migrate_legacy(&self) -> Option<SessionRecord> {
        // Cleanup of an earlier migration was interrupted; the encrypted copy wins
        if let Ok(Some(current)) = self.read_current() {
            self.discard_legacy();
            return Some(current);
        }

        let record = match legacy::read(self.store.as_ref()) {
            Ok(LegacySession::Found(record)) => record,
            Ok(LegacySession::Absent) => return None,
            Ok(LegacySession::Unreadable) => {
                self.discard_legacy();
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read legacy session");
                return None;
            }
        };

        if let Err(e) = self.persist(&record) {
            warn!(error = %e, "Legacy session migration deferred, encrypted write failed");
            return Some(record);
        }

        match self.read_current() {
            Ok(Some(ref stored)) if *stored == record => {}
            Ok(_) => {
                warn!("Legacy session migration deferred, readback mismatch");
                return Some(record);
            }
            Err(e) => {
                warn!(error = %e, "Legacy session migration deferred, readback failed");
                return Some(record);
            }
        }

        self.discard_legacy();
        info!("Legacy session migrated to encrypted vault");
        Some(record)
    }

    fn discard_legacy(&self) {
        if let Err(e) = self.store.remove_batch(&LEGACY_KEYS) {
            warn!(error = %e, "Failed to remove legacy session keys, will retry on next load");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use argon2::Params;

    use super::*;
    use crate::vault::keys::{
        DerivedKeyProvider, StaticKeyProvider, UnavailableKeyProvider, KEY_LEN,
    };
    use crate::vault::legacy::LEGACY_TOKEN_KEY;
    use crate::vault::store::{MemoryStore, StoreError};

    /// Memory store whose writes can be switched off
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_puts: AtomicBool,
        fail_batches: AtomicBool,
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.inner.put(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove(key)
        }

        fn remove_batch(&self, keys: &[&str]) -> Result<(), StoreError> {
            if self.fail_batches.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("interrupted")));
            }
            self.inner.remove_batch(keys)
        }
    }

    fn derived(store: Arc<dyn KeyValueStore>, secret: &str) -> Arc<dyn KeyProvider> {
        Arc::new(
            DerivedKeyProvider::new(store, Some(secret.to_string()))
                .with_params(Params::new(1024, 1, 1, Some(KEY_LEN)).unwrap()),
        )
    }

    fn static_vault(store: Arc<dyn KeyValueStore>) -> CredentialVault {
        CredentialVault::new(store, Arc::new(StaticKeyProvider::new("static", 9)))
    }

    #[test]
    fn test_persist_then_reload_from_storage() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let record = SessionRecord::new("T1", "S1", 0);

        let vault = CredentialVault::new(store.clone(), derived(store.clone(), "device"));
        vault.persist(&record).unwrap();
        drop(vault);

        let reloaded = CredentialVault::new(store.clone(), derived(store, "device"));
        assert_eq!(reloaded.load(), Some(record));
    }

    #[test]
    fn test_blob_is_not_plaintext() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let vault = static_vault(store.clone());
        vault.persist(&SessionRecord::new("visible-token", "S1", 0)).unwrap();

        let blob = store.get(SESSION_BLOB_KEY).unwrap().unwrap();
        let needle = b"visible-token";
        assert!(!blob.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_load_empty_store_is_none() {
        let vault = static_vault(Arc::new(MemoryStore::new()));
        assert_eq!(vault.load(), None);
    }

    #[test]
    fn test_corrupt_blob_loads_as_none() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.put(SESSION_BLOB_KEY, b"garbage").unwrap();
        assert_eq!(static_vault(store).load(), None);
    }

    #[test]
    fn test_different_key_loads_as_none() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        CredentialVault::new(store.clone(), derived(store.clone(), "one"))
            .persist(&SessionRecord::new("T1", "S1", 0))
            .unwrap();

        let other = CredentialVault::new(store.clone(), derived(store, "two"));
        assert_eq!(other.load(), None);
    }

    #[test]
    fn test_failed_persist_keeps_previous_blob() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let first = SessionRecord::new("T1", "S1", 0);
        static_vault(store.clone()).persist(&first).unwrap();

        let broken = CredentialVault::new(store.clone(), Arc::new(UnavailableKeyProvider));
        let err = broken.persist(&SessionRecord::new("T2", "S2", 0)).unwrap_err();
        assert!(matches!(err, SessionError::KeyUnavailable(_)));
        assert!(err.is_crypto_failure());

        assert_eq!(static_vault(store).load(), Some(first));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let vault = static_vault(store);
        vault.persist(&SessionRecord::new("T1", "S1", 0)).unwrap();
        assert!(vault.has_stored_session());

        vault.clear().unwrap();
        vault.clear().unwrap();
        assert!(!vault.has_stored_session());
        assert_eq!(vault.load(), None);
    }

    #[test]
    fn test_legacy_layout_is_migrated() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let record = SessionRecord::new("T0", "S0", 0)
            .with_ids(Some("u".to_string()), Some("g".to_string()));
        legacy::write(store.as_ref(), &record);

        let vault = static_vault(store.clone());
        assert_eq!(vault.load(), Some(record.clone()));

        for key in LEGACY_KEYS {
            assert!(!store.contains(key).unwrap(), "legacy key {} left behind", key);
        }
        assert!(vault.has_stored_session());
        // Second load reads the encrypted copy
        assert_eq!(static_vault(store).load(), Some(record));
    }

    #[test]
    fn test_migration_keeps_legacy_when_encrypted_write_fails() {
        let flaky = Arc::new(FlakyStore::default());
        let store: Arc<dyn KeyValueStore> = flaky.clone();
        let record = SessionRecord::new("T0", "S0", 0);
        legacy::write(store.as_ref(), &record);

        flaky.fail_puts.store(true, Ordering::SeqCst);
        let vault = static_vault(store.clone());
        assert_eq!(vault.load(), Some(record.clone()));
        assert!(store.contains(LEGACY_TOKEN_KEY).unwrap());
        assert!(!vault.has_stored_session());

        // Next start succeeds
        flaky.fail_puts.store(false, Ordering::SeqCst);
        assert_eq!(vault.load(), Some(record));
        assert!(!store.contains(LEGACY_TOKEN_KEY).unwrap());
        assert!(vault.has_stored_session());
    }

    #[test]
    fn test_interrupted_legacy_cleanup_is_recoverable() {
        let flaky = Arc::new(FlakyStore::default());
        let store: Arc<dyn KeyValueStore> = flaky.clone();
        let record = SessionRecord::new("T0", "S0", 0);
        legacy::write(store.as_ref(), &record);

        flaky.fail_batches.store(true, Ordering::SeqCst);
        let vault = static_vault(store.clone());
        assert_eq!(vault.load(), Some(record.clone()));
        // Both copies exist, neither is lost
        assert!(store.contains(LEGACY_TOKEN_KEY).unwrap());
        assert!(vault.has_stored_session());

        flaky.fail_batches.store(false, Ordering::SeqCst);
        assert_eq!(vault.load(), Some(record));
        assert!(!store.contains(LEGACY_TOKEN_KEY).unwrap());
    }

    #[test]
    fn test_unreadable_legacy_is_discarded() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.put(LEGACY_TOKEN_KEY, b"T0").unwrap();
        store.put(legacy::LEGACY_EXPIRATION_KEY, b"not-a-number").unwrap();

        assert_eq!(static_vault(store.clone()).load(), None);
        assert!(!store.contains(LEGACY_TOKEN_KEY).unwrap());
    }
}
