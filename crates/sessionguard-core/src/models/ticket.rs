use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Correlates a pending step-up request with its eventual resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketId(String);

impl TicketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier
    pub fn random() -> Self {
        let value: u128 = rand::thread_rng().gen();
        Self(format!("{:032x}", value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TicketId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketState {
    Pending,
    Approved,
    Denied,
    Expired,
}

/// Step-up verification ticket. State changes produce a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationTicket {
    id: TicketId,
    issued_at: i64,
    ttl_millis: i64,
    state: TicketState,
}

impl VerificationTicket {
    pub fn new(id: TicketId, issued_at: i64, ttl: Duration) -> Self {
        Self {
            id,
            issued_at,
            ttl_millis: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            state: TicketState::Pending,
        }
    }

    /// Issue a pending ticket with a random id
    pub fn issue(now_millis: i64, ttl: Duration) -> Self {
        Self::new(TicketId::random(), now_millis, ttl)
    }

    pub fn id(&self) -> &TicketId {
        &self.id
    }

    pub fn issued_at(&self) -> i64 {
        self.issued_at
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.ttl_millis).unwrap_or(0))
    }

    pub fn state(&self) -> TicketState {
        self.state
    }

    pub fn expires_at(&self) -> i64 {
        self.issued_at.saturating_add(self.ttl_millis)
    }

    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        now_millis >= self.expires_at()
    }

    pub fn is_pending(&self) -> bool {
        self.state == TicketState::Pending
    }

    pub fn with_state(&self, state: TicketState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}
