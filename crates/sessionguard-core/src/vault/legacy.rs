//! Pre-encryption flat-field session layout.
//!
//! Older releases stored each session field under its own plaintext key.
//! The layout is recognised by a non-empty `session.Token`.

use tracing::warn;

use super::store::{KeyValueStore, StoreError};
use crate::models::SessionRecord;

pub const LEGACY_TOKEN_KEY: &str = "session.Token";
pub const LEGACY_SECRET_KEY: &str = "session.Secret";
pub const LEGACY_EXPIRATION_KEY: &str = "session.ExpirationTime";
pub const LEGACY_UCID_KEY: &str = "ucid";
pub const LEGACY_GMID_KEY: &str = "gmid";

/// Every key belonging to the legacy layout, removed together after migration
pub const LEGACY_KEYS: [&str; 7] = [
    LEGACY_UCID_KEY,
    LEGACY_GMID_KEY,
    "lastLoginProvider",
    LEGACY_TOKEN_KEY,
    LEGACY_SECRET_KEY,
    "tsOffset",
    LEGACY_EXPIRATION_KEY,
];

/// Outcome of reading the legacy layout
#[derive(Debug, PartialEq, Eq)]
pub enum LegacySession {
    Absent,
    /// Present but unusable; its keys should be discarded
    Unreadable,
    Found(SessionRecord),
}

pub fn is_present(store: &dyn KeyValueStore) -> Result<bool, StoreError> {
    Ok(read_string(store, LEGACY_TOKEN_KEY)?.is_some_and(|t| !t.is_empty()))
}

pub fn read(store: &dyn KeyValueStore) -> Result<LegacySession, StoreError> {
    let token = match read_string(store, LEGACY_TOKEN_KEY)? {
        Some(token) if !token.is_empty() => token,
        _ => return Ok(LegacySession::Absent),
    };
    let secret = read_string(store, LEGACY_SECRET_KEY)?.unwrap_or_default();

    // A missing expiration meant "never expires" in the old layout
    let expiration = match read_string(store, LEGACY_EXPIRATION_KEY)? {
        None => 0,
        Some(raw) => match raw.trim().parse::<i64>() {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Legacy session expiration is not a number");
                return Ok(LegacySession::Unreadable);
            }
        },
    };

    let ucid = read_string(store, LEGACY_UCID_KEY)?;
    let gmid = read_string(store, LEGACY_GMID_KEY)?;

    Ok(LegacySession::Found(
        SessionRecord::new(token, secret, expiration).with_ids(ucid, gmid),
    ))
}

fn read_string(store: &dyn KeyValueStore, key: &str) -> Result<Option<String>, StoreError> {
    Ok(store
        .get(key)?
        .and_then(|bytes| String::from_utf8(bytes).ok()))
}

/// Write a legacy layout, as an old release would have
#[cfg(test)]
pub(crate) fn write(store: &dyn KeyValueStore, record: &SessionRecord) {
    store.put(LEGACY_TOKEN_KEY, record.token().as_bytes()).unwrap();
    store.put(LEGACY_SECRET_KEY, record.secret().as_bytes()).unwrap();
    store
        .put(LEGACY_EXPIRATION_KEY, record.expiration_time().to_string().as_bytes())
        .unwrap();
    if let Some(ucid) = record.ucid() {
        store.put(LEGACY_UCID_KEY, ucid.as_bytes()).unwrap();
    }
    if let Some(gmid) = record.gmid() {
        store.put(LEGACY_GMID_KEY, gmid.as_bytes()).unwrap();
    }
    store.put("tsOffset", b"0").unwrap();
    store.put("lastLoginProvider", b"site").unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::store::MemoryStore;

    #[test]
    fn test_absent_when_token_missing_or_empty() {
        let store = MemoryStore::new();
        assert_eq!(read(&store).unwrap(), LegacySession::Absent);
        store.put(LEGACY_TOKEN_KEY, b"").unwrap();
        assert!(!is_present(&store).unwrap());
        assert_eq!(read(&store).unwrap(), LegacySession::Absent);
    }

    #[test]
    fn test_reads_all_fields() {
        let store = MemoryStore::new();
        let record = SessionRecord::new("T0", "S0", 1234)
            .with_ids(Some("ucid-1".to_string()), Some("gmid-1".to_string()));
        write(&store, &record);

        assert!(is_present(&store).unwrap());
        assert_eq!(read(&store).unwrap(), LegacySession::Found(record));
    }

    #[test]
    fn test_missing_expiration_means_never() {
        let store = MemoryStore::new();
        store.put(LEGACY_TOKEN_KEY, b"T0").unwrap();
        store.put(LEGACY_SECRET_KEY, b"S0").unwrap();
        match read(&store).unwrap() {
            LegacySession::Found(record) => assert_eq!(record.expiration_time(), 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_garbled_expiration_is_unreadable() {
        let store = MemoryStore::new();
        store.put(LEGACY_TOKEN_KEY, b"T0").unwrap();
        store.put(LEGACY_EXPIRATION_KEY, b"soon").unwrap();
        assert_eq!(read(&store).unwrap(), LegacySession::Unreadable);
    }
}
