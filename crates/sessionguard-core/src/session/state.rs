use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::models::{SessionRecord, VerificationTicket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Unauthenticated,
    Active,
    PendingStepUp,
    Invalid,
}

impl SessionState {
    /// States that hold trusted credentials and can be invalidated
    pub fn is_authenticated(self) -> bool {
        matches!(self, SessionState::Active | SessionState::PendingStepUp)
    }

    pub fn can_activate(self) -> bool {
        matches!(self, SessionState::Unauthenticated | SessionState::Invalid)
    }
}

/// Why trust in the session was withdrawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The identity service refused a periodic verification
    RemoteRejected,
    /// A step-up prompt was denied on the second channel
    StepUpDenied,
    Other(String),
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationReason::RemoteRejected => f.write_str("remote-rejected"),
            InvalidationReason::StepUpDenied => f.write_str("step-up-denied"),
            InvalidationReason::Other(reason) => f.write_str(reason),
        }
    }
}

/// Immutable view of the session published after every transition.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub record: Option<Arc<SessionRecord>>,
    pub pending_ticket: Option<VerificationTicket>,
    /// Incremented on every transition
    pub epoch: u64,
}

impl SessionSnapshot {
    pub(crate) fn unauthenticated() -> Self {
        Self {
            state: SessionState::Unauthenticated,
            record: None,
            pending_ticket: None,
            epoch: 0,
        }
    }

    /// Active with a record that is valid at `now_millis`
    pub fn is_valid_at(&self, now_millis: i64) -> bool {
        self.state == SessionState::Active
            && self
                .record
                .as_ref()
                .is_some_and(|record| record.is_valid_at(now_millis))
    }
}
