//! Encrypted persistence for session credentials.
//!
//! This module provides:
//! - `CredentialVault`: persist/load/clear of the sealed session blob, including
//!   one-shot migration of the legacy plaintext layout
//! - `KeyValueStore`: the storage seam, with memory and atomic file backends
//! - `KeyProvider`: key provisioning, OS keychain first with an Argon2id fallback

pub mod cipher;
pub mod credential_vault;
pub mod keys;
pub mod legacy;
pub mod store;

pub use cipher::VaultEntry;
pub use credential_vault::CredentialVault;
pub use keys::{
    DerivedKeyProvider, FallbackKeyProvider, KeyError, KeyHandle, KeyProvider,
    KeychainKeyProvider,
};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
