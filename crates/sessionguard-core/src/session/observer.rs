//! Notification interface for components that depend on the session.
//!
//! Callbacks fire outside every session lock. Delivery is at-least-once, so
//! consumers must treat a repeated invalidation as a no-op.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use super::state::{InvalidationReason, SessionState};
use crate::models::TicketId;

/// Identifies a displayed step-up prompt that should be withdrawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSuppression {
    pub ticket_id: Option<TicketId>,
    pub notification_id: Option<i64>,
}

impl PromptSuppression {
    pub fn for_ticket(ticket_id: TicketId) -> Self {
        Self {
            ticket_id: Some(ticket_id),
            notification_id: None,
        }
    }
}

pub trait SessionObserver: Send + Sync {
    fn on_invalidated(&self, reason: &InvalidationReason);

    fn on_prompt_suppress_requested(&self, prompt: &PromptSuppression);

    fn on_state_changed(&self, _state: SessionState) {}
}

/// Observer callbacks as values, for channel delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Invalidated(InvalidationReason),
    SuppressPrompt(PromptSuppression),
    StateChanged(SessionState),
}

/// Forwards callbacks into an mpsc channel.
///
/// Events are dropped with a warning when the receiver lags or is gone;
/// callbacks never block the session.
pub struct ChannelObserver {
    tx: mpsc::Sender<SessionEvent>,
}

impl ChannelObserver {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    fn send(&self, event: SessionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "Failed to deliver session event");
        }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_invalidated(&self, reason: &InvalidationReason) {
        self.send(SessionEvent::Invalidated(reason.clone()));
    }

    fn on_prompt_suppress_requested(&self, prompt: &PromptSuppression) {
        self.send(SessionEvent::SuppressPrompt(prompt.clone()));
    }

    fn on_state_changed(&self, state: SessionState) {
        self.send(SessionEvent::StateChanged(state));
    }
}

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl ObserverRegistry {
    pub(crate) fn register(&self, observer: Arc<dyn SessionObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn dispatch(&self, event: &SessionEvent) {
        // Callbacks run without the registry lock held
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            match event {
                SessionEvent::Invalidated(reason) => observer.on_invalidated(reason),
                SessionEvent::SuppressPrompt(prompt) => {
                    observer.on_prompt_suppress_requested(prompt)
                }
                SessionEvent::StateChanged(state) => observer.on_state_changed(*state),
            }
        }
    }
}

/// Observer that records everything it hears
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub(crate) events: std::sync::Mutex<Vec<SessionEvent>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub(crate) fn invalidations(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Invalidated(_)))
            .count()
    }

    pub(crate) fn suppressions(&self) -> Vec<PromptSuppression> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::SuppressPrompt(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
impl SessionObserver for RecordingObserver {
    fn on_invalidated(&self, reason: &InvalidationReason) {
        self.events
            .lock()
            .unwrap()
            .push(SessionEvent::Invalidated(reason.clone()));
    }

    fn on_prompt_suppress_requested(&self, prompt: &PromptSuppression) {
        self.events
            .lock()
            .unwrap()
            .push(SessionEvent::SuppressPrompt(prompt.clone()));
    }

    fn on_state_changed(&self, state: SessionState) {
        self.events.lock().unwrap().push(SessionEvent::StateChanged(state));
    }
}
