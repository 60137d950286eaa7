//! Authoritative session state and its observers.
//!
//! This module provides:
//! - `SessionStateMachine`: serialized transitions between `Unauthenticated`,
//!   `Active`, `PendingStepUp` and `Invalid`
//! - `SessionSnapshot`: lock-free view published after every transition
//! - `SessionObserver` / `ChannelObserver`: invalidation and prompt notifications

pub mod machine;
pub mod observer;
pub mod state;

pub use machine::{SessionStateMachine, StepUpOutcome};
pub use observer::{ChannelObserver, PromptSuppression, SessionEvent, SessionObserver};
pub use state::{InvalidationReason, SessionSnapshot, SessionState};
