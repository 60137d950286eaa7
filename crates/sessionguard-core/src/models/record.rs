use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Authenticated session credential.
///
/// Immutable once built: updates produce a new value. Token and secret are
/// wiped from memory when the last copy is dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SessionRecord {
    #[serde(rename = "sessionToken")]
    token: String,
    #[serde(rename = "sessionSecret")]
    secret: String,
    /// Absolute expiry in epoch milliseconds, 0 = never expires
    #[serde(rename = "expirationTime")]
    expiration_time: i64,
    #[serde(default)]
    ucid: Option<String>,
    #[serde(default)]
    gmid: Option<String>,
}

impl SessionRecord {
    pub fn new(token: impl Into<String>, secret: impl Into<String>, expiration_time: i64) -> Self {
        Self {
            token: token.into(),
            secret: secret.into(),
            expiration_time,
            ucid: None,
            gmid: None,
        }
    }

    /// Build a record from a relative lifetime as returned by the identity service.
    /// A non-positive lifetime means the session never expires.
    pub fn expiring_in(
        token: impl Into<String>,
        secret: impl Into<String>,
        expires_in_secs: i64,
        now_millis: i64,
    ) -> Self {
        let expiration_time = if expires_in_secs > 0 {
            now_millis.saturating_add(expires_in_secs.saturating_mul(1000))
        } else {
            0
        };
        Self::new(token, secret, expiration_time)
    }

    /// Attach device/session correlation identifiers
    pub fn with_ids(mut self, ucid: Option<String>, gmid: Option<String>) -> Self {
        self.ucid = ucid;
        self.gmid = gmid;
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expiration_time(&self) -> i64 {
        self.expiration_time
    }

    pub fn ucid(&self) -> Option<&str> {
        self.ucid.as_deref()
    }

    pub fn gmid(&self) -> Option<&str> {
        self.gmid.as_deref()
    }

    /// Valid iff it never expires or expires strictly after `now_millis`
    pub fn is_valid_at(&self, now_millis: i64) -> bool {
        self.expiration_time == 0 || self.expiration_time > now_millis
    }

    /// Both credential halves are present
    pub fn is_complete(&self) -> bool {
        !self.token.is_empty() && !self.secret.is_empty()
    }

    /// Complete and unexpired: the only kind of record that may be activated
    pub fn is_usable_at(&self, now_millis: i64) -> bool {
        self.is_complete() && self.is_valid_at(now_millis)
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("token", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("expiration_time", &self.expiration_time)
            .field("ucid", &self.ucid)
            .field("gmid", &self.gmid)
            .finish()
    }
}
