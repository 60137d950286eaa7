//! Error taxonomy for the session lifecycle engine.
//!
//! Nothing in this crate is fatal to the process: every variant maps to a
//! well-defined degraded state (`Unauthenticated` or `Invalid`) or a no-op.

use thiserror::Error;

use crate::models::TicketId;
use crate::session::SessionState;

/// Maximum length for remote error messages kept in errors and logs
const MAX_ERROR_MESSAGE_LENGTH: usize = 200;

/// Failure reported by the identity service collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connectivity or transport problem; never a reason to drop the session.
    #[error("Network error: {0}")]
    Network(String),

    /// The identity service answered and refused the request.
    #[error("Remote rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },
}

impl RemoteError {
    pub fn rejected(code: i64, message: impl Into<String>) -> Self {
        RemoteError::Rejected {
            code,
            message: truncate(message.into()),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Transient network error - retry later: {0}")]
    TransientNetwork(String),

    #[error("Identity service rejected the session (code {code})")]
    RemoteRejection { code: i64 },

    /// Sealing or serializing the record failed. Together with
    /// `KeyUnavailable` this is the encryption-failure family; match both
    /// through `is_crypto_failure`.
    #[error("Credential encryption failed: {0}")]
    CryptoFailure(String),

    #[error("Malformed external event: {0}")]
    MalformedExternalEvent(String),

    #[error("Stale ticket: {0}")]
    StaleTicket(TicketId),

    #[error("Session record is expired or incomplete")]
    InvalidRecord,

    #[error("Cannot {event} while session is {from:?}")]
    InvalidTransition {
        from: SessionState,
        event: &'static str,
    },

    /// Encryption failed because no provider could supply the vault key
    #[error("Encryption key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl SessionError {
    /// Whether a direct caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::TransientNetwork(_))
    }

    /// The vault could not encrypt, including for lack of a key
    pub fn is_crypto_failure(&self) -> bool {
        matches!(
            self,
            SessionError::CryptoFailure(_) | SessionError::KeyUnavailable(_)
        )
    }
}

impl From<RemoteError> for SessionError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(msg) => SessionError::TransientNetwork(msg),
            RemoteError::Rejected { code, .. } => SessionError::RemoteRejection { code },
        }
    }
}

fn truncate(message: String) -> String {
    if message.len() <= MAX_ERROR_MESSAGE_LENGTH {
        return message;
    }
    let mut end = MAX_ERROR_MESSAGE_LENGTH;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &message[..end], message.len())
}
