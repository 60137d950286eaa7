//! Encryption key provisioning for the vault.
//!
//! Providers are interchangeable: the OS keychain is preferred, with an
//! Argon2id-derived key as fallback. Each key carries a stable reference that
//! the vault stores next to the ciphertext, so a blob is always opened with
//! the same provider that sealed it.

use std::sync::{Arc, Mutex, PoisonError};

use argon2::{Algorithm, Argon2, Params, Version};
use keyring::Entry;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::store::KeyValueStore;

/// Length of every vault key in bytes (XChaCha20-Poly1305)
pub const KEY_LEN: usize = 32;

/// Store key holding the Argon2id salt for the derived provider
const SALT_KEY: &str = "vault.salt";

/// Store key holding the per-install seed used when no device secret is configured
const INSTALL_SEED_KEY: &str = "vault.seed";

const SALT_LEN: usize = 16;

pub const KEYCHAIN_KEY_REF: &str = "keychain";
pub const DERIVED_KEY_REF: &str = "derived";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key unavailable: {0}")]
    Unavailable(String),
}

/// Symmetric key plus the reference of the provider that produced it.
/// Key bytes are wiped on drop.
pub struct KeyHandle {
    key_ref: String,
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl KeyHandle {
    pub fn new(key_ref: impl Into<String>, key: [u8; KEY_LEN]) -> Self {
        Self {
            key_ref: key_ref.into(),
            key: Zeroizing::new(key),
        }
    }

    pub fn key_ref(&self) -> &str {
        &self.key_ref
    }

    pub(crate) fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

pub trait KeyProvider: Send + Sync {
    /// Key used for new writes, created on first use
    fn get_or_create_key(&self) -> Result<KeyHandle, KeyError>;

    /// Key previously used under `key_ref`
    fn key_for(&self, key_ref: &str) -> Result<KeyHandle, KeyError> {
        let handle = self.get_or_create_key()?;
        if handle.key_ref() == key_ref {
            Ok(handle)
        } else {
            Err(KeyError::Unavailable(format!("no key for reference '{}'", key_ref)))
        }
    }
}

// ============================================================================
// OS keychain
// ============================================================================

/// Random key stored in the OS keychain
pub struct KeychainKeyProvider {
    service: String,
    account: String,
}

impl KeychainKeyProvider {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<Entry, KeyError> {
        Entry::new(&self.service, &self.account)
            .map_err(|e| KeyError::Unavailable(format!("keyring entry: {}", e)))
    }

    fn read_key(&self) -> Result<Option<[u8; KEY_LEN]>, KeyError> {
        match self.entry()?.get_secret() {
            Ok(secret) => {
                let secret = Zeroizing::new(secret);
                let key: [u8; KEY_LEN] = secret.as_slice().try_into().map_err(|_| {
                    KeyError::Unavailable(format!(
                        "keychain secret has {} bytes, expected {}",
                        secret.len(),
                        KEY_LEN
                    ))
                })?;
                Ok(Some(key))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeyError::Unavailable(format!("keychain read: {}", e))),
        }
    }
}

impl KeyProvider for KeychainKeyProvider {
    fn get_or_create_key(&self) -> Result<KeyHandle, KeyError> {
        if let Some(key) = self.read_key()? {
            return Ok(KeyHandle::new(KEYCHAIN_KEY_REF, key));
        }

        let mut key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        self.entry()?
            .set_secret(&key)
            .map_err(|e| KeyError::Unavailable(format!("keychain write: {}", e)))?;

        // Backends without persistence hand out a fresh entry every time
        match self.read_key()? {
            Some(stored) if stored == key => {
                debug!(service = %self.service, "Created vault key in keychain");
                Ok(KeyHandle::new(KEYCHAIN_KEY_REF, key))
            }
            _ => Err(KeyError::Unavailable(
                "keychain backend does not persist secrets".to_string(),
            )),
        }
    }
}

// ============================================================================
// Software-derived
// ============================================================================

/// Argon2id key derived from a device secret and a persisted random salt.
///
/// Without a configured device secret a random per-install seed kept in the
/// same store is used instead, which only protects against casual inspection.
pub struct DerivedKeyProvider {
    store: Arc<dyn KeyValueStore>,
    device_secret: Option<Zeroizing<String>>,
    params: Params,
    cached: Mutex<Option<Zeroizing<[u8; KEY_LEN]>>>,
}

impl DerivedKeyProvider {
    pub fn new(store: Arc<dyn KeyValueStore>, device_secret: Option<String>) -> Self {
        Self {
            store,
            device_secret: device_secret.map(Zeroizing::new),
            params: Params::default(),
            cached: Mutex::new(None),
        }
    }

    /// Override Argon2 cost parameters
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    fn load_or_create(&self, key: &str, len: usize) -> Result<Vec<u8>, KeyError> {
        let existing = self
            .store
            .get(key)
            .map_err(|e| KeyError::Unavailable(format!("reading {}: {}", key, e)))?;
        if let Some(value) = existing.filter(|v| v.len() == len) {
            return Ok(value);
        }
        let mut value = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut value);
        self.store
            .put(key, &value)
            .map_err(|e| KeyError::Unavailable(format!("writing {}: {}", key, e)))?;
        Ok(value)
    }

    fn derive(&self) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
        let salt = self.load_or_create(SALT_KEY, SALT_LEN)?;
        let password: Zeroizing<Vec<u8>> = match &self.device_secret {
            Some(secret) => Zeroizing::new(secret.as_bytes().to_vec()),
            None => Zeroizing::new(self.load_or_create(INSTALL_SEED_KEY, KEY_LEN)?),
        };

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(&password, &salt, &mut key[..])
            .map_err(|e| KeyError::Unavailable(format!("key derivation failed: {}", e)))?;
        Ok(key)
    }
}

impl KeyProvider for DerivedKeyProvider {
    fn get_or_create_key(&self) -> Result<KeyHandle, KeyError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if cached.is_none() {
            *cached = Some(self.derive()?);
        }
        match cached.as_ref() {
            Some(key) => Ok(KeyHandle::new(DERIVED_KEY_REF, **key)),
            None => Err(KeyError::Unavailable("derived key missing".to_string())),
        }
    }
}

// ============================================================================
// Preference chain
// ============================================================================

/// Prefers `primary` and falls back when it reports the key unavailable
pub struct FallbackKeyProvider {
    primary: Box<dyn KeyProvider>,
    fallback: Box<dyn KeyProvider>,
}

impl FallbackKeyProvider {
    pub fn new(primary: Box<dyn KeyProvider>, fallback: Box<dyn KeyProvider>) -> Self {
        Self { primary, fallback }
    }
}

impl KeyProvider for FallbackKeyProvider {
    fn get_or_create_key(&self) -> Result<KeyHandle, KeyError> {
        match self.primary.get_or_create_key() {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(error = %e, "Preferred key provider unavailable, using fallback");
                self.fallback.get_or_create_key()
            }
        }
    }

    fn key_for(&self, key_ref: &str) -> Result<KeyHandle, KeyError> {
        self.primary
            .key_for(key_ref)
            .or_else(|_| self.fallback.key_for(key_ref))
    }
}

/// Fixed in-memory key for tests
#[cfg(test)]
pub(crate) struct StaticKeyProvider {
    key_ref: &'static str,
    key: [u8; KEY_LEN],
}

#[cfg(test)]
impl StaticKeyProvider {
    pub(crate) fn new(key_ref: &'static str, fill: u8) -> Self {
        Self {
            key_ref,
            key: [fill; KEY_LEN],
        }
    }
}

#[cfg(test)]
impl KeyProvider for StaticKeyProvider {
    fn get_or_create_key(&self) -> Result<KeyHandle, KeyError> {
        Ok(KeyHandle::new(self.key_ref, self.key))
    }
}

#[cfg(test)]
pub(crate) struct UnavailableKeyProvider;

#[cfg(test)]
impl KeyProvider for UnavailableKeyProvider {
    fn get_or_create_key(&self) -> Result<KeyHandle, KeyError> {
        Err(KeyError::Unavailable("no hardware".to_string()))
    }
}
