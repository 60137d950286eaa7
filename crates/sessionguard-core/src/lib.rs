//! sessionguard-core - session lifecycle engine.
//!
//! Keeps an authenticated session trustworthy over its lifetime:
//! - `vault`: encrypted at-rest credentials with legacy plaintext migration
//! - `session`: the single authoritative state machine and its observers
//! - `verifier`: periodic remote re-verification with restart-stable cadence
//! - `push`: second-channel approval of step-up challenges
//!
//! Components are wired by constructor injection; there is no global state.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod push;
pub mod session;
pub mod vault;
pub mod verifier;

#[cfg(test)]
mod testing;

pub use api::{HttpIdentityService, IdentityService};
pub use clock::{Clock, SystemClock};
pub use config::SessionConfig;
pub use error::{RemoteError, SessionError};
pub use models::{SessionRecord, TicketId, TicketState, VerificationTicket};
pub use push::{ActionLabels, PushAction, PushApprovalGateway, PushEvent, PushOutcome};
pub use session::{
    ChannelObserver, InvalidationReason, PromptSuppression, SessionEvent, SessionObserver,
    SessionSnapshot, SessionState, SessionStateMachine, StepUpOutcome,
};
pub use vault::CredentialVault;
pub use verifier::{TickOutcome, Verifier};
