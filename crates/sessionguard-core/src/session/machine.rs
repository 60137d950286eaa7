//! The single authoritative session state.
//!
//! All transitions are serialized through `inner`. Vault I/O never happens
//! while `inner` is held: a transition copies what it needs out, releases the
//! lock, performs the I/O, then re-enters and re-checks the epoch before
//! committing. `write_gate` orders vault writes against each other and is
//! always taken before `inner`, never after.
//!
//! Readers go through the published `SessionSnapshot` and never touch the lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::observer::{ObserverRegistry, PromptSuppression, SessionEvent, SessionObserver};
use super::state::{InvalidationReason, SessionSnapshot, SessionState};
use crate::clock::Clock;
use crate::error::SessionError;
use crate::models::{SessionRecord, TicketId, TicketState, VerificationTicket};
use crate::vault::CredentialVault;

/// Resolution delivered for a pending step-up ticket
#[derive(Debug, Clone)]
pub enum StepUpOutcome {
    /// Approved; carries the record exchanged for the approval token
    Approved(SessionRecord),
    Denied,
}

struct PendingTicket {
    ticket: VerificationTicket,
    /// A resolution is in flight; further claims see the ticket as stale
    claimed: bool,
}

struct Inner {
    state: SessionState,
    record: Option<Arc<SessionRecord>>,
    pending: Option<PendingTicket>,
    /// Most recently resolved, expired or dropped ticket
    last_ticket: Option<TicketId>,
    epoch: u64,
}

impl Inner {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            record: self.record.clone(),
            pending_ticket: self.pending.as_ref().map(|p| p.ticket.clone()),
            epoch: self.epoch,
        }
    }

    fn pending_matches(&self, id: &TicketId) -> bool {
        self.state == SessionState::PendingStepUp
            && self.pending.as_ref().is_some_and(|p| p.ticket.id() == id)
    }

    fn take_pending(&mut self) -> Option<PendingTicket> {
        let pending = self.pending.take()?;
        self.last_ticket = Some(pending.ticket.id().clone());
        Some(pending)
    }
}

pub struct SessionStateMachine {
    inner: Mutex<Inner>,
    write_gate: Mutex<()>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    vault: Arc<CredentialVault>,
    clock: Arc<dyn Clock>,
    observers: ObserverRegistry,
}

impl SessionStateMachine {
    pub fn new(vault: Arc<CredentialVault>, clock: Arc<dyn Clock>) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::unauthenticated());
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Unauthenticated,
                record: None,
                pending: None,
                last_ticket: None,
                epoch: 0,
            }),
            write_gate: Mutex::new(()),
            snapshot_tx,
            vault,
            clock,
            observers: ObserverRegistry::default(),
        }
    }

    pub fn register_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.register(observer);
    }

    // ===== Queries (lock-free) =====

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot_tx.borrow().state
    }

    pub fn pending_ticket(&self) -> Option<VerificationTicket> {
        self.snapshot_tx.borrow().pending_ticket.clone()
    }

    /// Active with a record that is unexpired right now
    pub fn is_valid(&self) -> bool {
        self.snapshot_tx
            .borrow()
            .is_valid_at(self.clock.now_millis())
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Ticket a resolution without an explicit id applies to: the pending
    /// one, otherwise the one most recently resolved or expired.
    pub fn resolution_target(&self) -> Option<TicketId> {
        let inner = self.lock();
        inner
            .pending
            .as_ref()
            .map(|p| p.ticket.id().clone())
            .or_else(|| inner.last_ticket.clone())
    }

    /// Run `f` ordered against state commits.
    ///
    /// Holds only the transition lock, never the write gate, so it does not
    /// wait on vault I/O.
    pub fn fenced<R>(&self, f: impl FnOnce() -> R) -> R {
        let _inner = self.lock();
        f()
    }

    // ===== Login / logout =====

    /// Load a persisted session at startup and activate it if still valid.
    /// An expired stored record is removed.
    pub fn restore(&self) -> SessionState {
        let _gate = self.gate();
        let Some(record) = self.vault.load() else {
            debug!("No stored session to restore");
            return self.state();
        };

        if !record.is_usable_at(self.clock.now_millis()) {
            info!("Stored session expired, clearing");
            if let Err(e) = self.vault.clear() {
                warn!(error = %e, "Failed to clear expired session");
            }
            return self.state();
        }

        match self.activate(record) {
            Ok(()) => info!("Session restored from vault"),
            Err(e) => warn!(error = %e, "Stored session not restored"),
        }
        self.state()
    }

    /// Persist `record` then activate it
    pub fn login(&self, record: SessionRecord) -> Result<(), SessionError> {
        if !record.is_usable_at(self.clock.now_millis()) {
            return Err(SessionError::InvalidRecord);
        }
        let _gate = self.gate();
        let state = self.state();
        if !state.can_activate() {
            return Err(SessionError::InvalidTransition {
                from: state,
                event: "login",
            });
        }
        self.vault.persist(&record)?;
        self.activate(record)
    }

    /// Adopt an already-persisted record.
    pub fn activate(&self, record: SessionRecord) -> Result<(), SessionError> {
        let now = self.clock.now_millis();
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            if !record.is_usable_at(now) {
                warn!(expiration = record.expiration_time(), "Rejected activation with unusable record");
                return Err(SessionError::InvalidRecord);
            }
            if !inner.state.can_activate() {
                return Err(SessionError::InvalidTransition {
                    from: inner.state,
                    event: "activate",
                });
            }
            inner.state = SessionState::Active;
            inner.record = Some(Arc::new(record));
            inner.take_pending();
            self.publish(&mut inner);
            events.push(SessionEvent::StateChanged(SessionState::Active));
        }
        debug!("Session activated");
        self.dispatch(events);
        Ok(())
    }

    /// Drop the session from any state and remove it from the vault
    pub fn logout(&self) -> Result<(), SessionError> {
        let _gate = self.gate();
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            if let Some(pending) = inner.take_pending() {
                events.push(SessionEvent::SuppressPrompt(PromptSuppression::for_ticket(
                    pending.ticket.id().clone(),
                )));
            }
            inner.record = None;
            if inner.state != SessionState::Unauthenticated {
                inner.state = SessionState::Unauthenticated;
                self.publish(&mut inner);
                events.push(SessionEvent::StateChanged(SessionState::Unauthenticated));
            }
        }
        let result = self.vault.clear();
        info!("Logged out");
        self.dispatch(events);
        result
    }

    /// Ask observers to withdraw a displayed step-up prompt
    pub fn request_prompt_suppression(&self, prompt: PromptSuppression) {
        debug!(ticket = ?prompt.ticket_id, notification = ?prompt.notification_id, "Suppressing prompt");
        self.dispatch(vec![SessionEvent::SuppressPrompt(prompt)]);
    }

    // ===== Invalidation =====

    /// Withdraw trust in the session.
    ///
    /// Returns `true` only for the call that performed the transition; later
    /// calls, or calls without an authenticated session, have no effect.
    pub fn invalidate(&self, reason: InvalidationReason) -> bool {
        self.invalidate_if(reason, || true)
    }

    /// Invalidate only if `still_current` holds at commit time.
    ///
    /// The predicate runs under the transition lock after the write gate is
    /// taken, and only when an authenticated session exists. Returning
    /// `false` from it discards the invalidation.
    pub fn invalidate_if(
        &self,
        reason: InvalidationReason,
        still_current: impl FnOnce() -> bool,
    ) -> bool {
        let _gate = self.gate();
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            if !inner.state.is_authenticated() {
                debug!(state = ?inner.state, %reason, "Invalidate ignored");
                return false;
            }
            if !still_current() {
                debug!(%reason, "Invalidation overtaken, discarding");
                return false;
            }
            if let Some(pending) = inner.take_pending() {
                events.push(SessionEvent::SuppressPrompt(PromptSuppression::for_ticket(
                    pending.ticket.id().clone(),
                )));
            }
            inner.state = SessionState::Invalid;
            inner.record = None;
            self.publish(&mut inner);
        }
        if let Err(e) = self.vault.clear() {
            warn!(error = %e, "Failed to clear vault during invalidation");
        }
        warn!(%reason, "Session invalidated");
        events.push(SessionEvent::Invalidated(reason));
        events.push(SessionEvent::StateChanged(SessionState::Invalid));
        self.dispatch(events);
        true
    }

    // ===== Step-up =====

    /// Issue a fresh ticket and move to `PendingStepUp`
    pub fn begin_step_up(&self, ttl: Duration) -> Result<VerificationTicket, SessionError> {
        let ticket = VerificationTicket::issue(self.clock.now_millis(), ttl);
        self.request_step_up(ticket.clone())?;
        Ok(ticket)
    }

    pub fn request_step_up(&self, ticket: VerificationTicket) -> Result<(), SessionError> {
        let now = self.clock.now_millis();
        let mut events = Vec::new();
        let result = {
            let mut inner = self.lock();
            self.sweep_locked(&mut inner, now, &mut events);
            if inner.state != SessionState::Active {
                Err(SessionError::InvalidTransition {
                    from: inner.state,
                    event: "request step-up",
                })
            } else if !ticket.is_pending() || ticket.is_expired_at(now) {
                Err(SessionError::StaleTicket(ticket.id().clone()))
            } else {
                debug!(ticket = %ticket.id(), "Step-up requested");
                inner.state = SessionState::PendingStepUp;
                inner.pending = Some(PendingTicket {
                    ticket,
                    claimed: false,
                });
                self.publish(&mut inner);
                events.push(SessionEvent::StateChanged(SessionState::PendingStepUp));
                Ok(())
            }
        };
        self.dispatch(events);
        result
    }

    /// Reserve the pending ticket for a resolution in progress.
    ///
    /// A second claim for the same ticket fails with `StaleTicket`.
    pub fn claim_ticket(&self, id: &TicketId) -> Result<VerificationTicket, SessionError> {
        let now = self.clock.now_millis();
        let mut events = Vec::new();
        let result = {
            let mut inner = self.lock();
            self.sweep_locked(&mut inner, now, &mut events);
            let claimable = inner.pending_matches(id);
            match inner.pending.as_mut() {
                Some(pending) if claimable && !pending.claimed => {
                    pending.claimed = true;
                    Ok(pending.ticket.clone())
                }
                _ => Err(SessionError::StaleTicket(id.clone())),
            }
        };
        self.dispatch(events);
        result
    }

    /// Return a claimed ticket to plain pending after a failed resolution attempt
    pub fn release_claim(&self, id: &TicketId) {
        let mut inner = self.lock();
        if let Some(pending) = inner.pending.as_mut() {
            if pending.ticket.id() == id {
                pending.claimed = false;
            }
        }
    }

    /// Apply an approve/deny decision to the pending ticket.
    ///
    /// Unknown, expired, or already-resolved tickets yield `StaleTicket` and
    /// leave the state unchanged. Returns the ticket in its final state.
    pub fn resolve_step_up(
        &self,
        id: &TicketId,
        outcome: StepUpOutcome,
    ) -> Result<VerificationTicket, SessionError> {
        let _gate = self.gate();
        match outcome {
            StepUpOutcome::Denied => self.deny_pending(id),
            StepUpOutcome::Approved(record) => self.approve_pending(id, record),
        }
    }

    /// Expire the pending ticket if its TTL has passed.
    /// Returns the expired ticket, if any.
    pub fn sweep_expired_ticket(&self) -> Option<VerificationTicket> {
        let now = self.clock.now_millis();
        let mut events = Vec::new();
        let expired = {
            let mut inner = self.lock();
            self.sweep_locked(&mut inner, now, &mut events)
        };
        self.dispatch(events);
        expired
    }

    fn deny_pending(&self, id: &TicketId) -> Result<VerificationTicket, SessionError> {
        let now = self.clock.now_millis();
        let mut events = Vec::new();
        let denied = {
            let mut inner = self.lock();
            self.sweep_locked(&mut inner, now, &mut events);
            if !inner.pending_matches(id) {
                drop(inner);
                self.dispatch(events);
                warn!(ticket = %id, "Deny for stale ticket");
                return Err(SessionError::StaleTicket(id.clone()));
            }
            let ticket = inner
                .take_pending()
                .map(|p| p.ticket.with_state(TicketState::Denied))
                .ok_or_else(|| SessionError::StaleTicket(id.clone()))?;
            inner.state = SessionState::Invalid;
            inner.record = None;
            self.publish(&mut inner);
            ticket
        };

        if let Err(e) = self.vault.clear() {
            warn!(error = %e, "Failed to clear vault after denied step-up");
        }
        warn!(ticket = %id, "Step-up denied, session invalidated");
        events.push(SessionEvent::Invalidated(InvalidationReason::StepUpDenied));
        events.push(SessionEvent::StateChanged(SessionState::Invalid));
        self.dispatch(events);
        Ok(denied)
    }

    fn approve_pending(
        &self,
        id: &TicketId,
        record: SessionRecord,
    ) -> Result<VerificationTicket, SessionError> {
        let now = self.clock.now_millis();
        let mut events = Vec::new();

        let epoch = {
            let mut inner = self.lock();
            self.sweep_locked(&mut inner, now, &mut events);
            if !inner.pending_matches(id) {
                drop(inner);
                self.dispatch(events);
                warn!(ticket = %id, "Approval for stale ticket");
                return Err(SessionError::StaleTicket(id.clone()));
            }
            if !record.is_usable_at(now) {
                if let Some(pending) = inner.pending.as_mut() {
                    pending.claimed = false;
                }
                drop(inner);
                self.dispatch(events);
                return Err(SessionError::InvalidRecord);
            }
            inner.epoch
        };

        if let Err(e) = self.vault.persist(&record) {
            // The approval stands; the record just won't survive a restart
            warn!(error = %e, "Failed to persist step-up session");
        }

        let approved = {
            let mut inner = self.lock();
            if inner.epoch != epoch || !inner.pending_matches(id) {
                let current = inner.record.clone();
                drop(inner);
                self.restore_vault(current.as_deref());
                self.dispatch(events);
                warn!(ticket = %id, "Session changed during approval, discarding");
                return Err(SessionError::StaleTicket(id.clone()));
            }
            let ticket = inner
                .take_pending()
                .map(|p| p.ticket.with_state(TicketState::Approved))
                .ok_or_else(|| SessionError::StaleTicket(id.clone()))?;
            inner.state = SessionState::Active;
            inner.record = Some(Arc::new(record));
            self.publish(&mut inner);
            ticket
        };

        info!(ticket = %id, "Step-up approved");
        events.push(SessionEvent::StateChanged(SessionState::Active));
        self.dispatch(events);
        Ok(approved)
    }

    /// Expire the pending ticket under the lock, queueing its notifications
    fn sweep_locked(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        now: i64,
        events: &mut Vec<SessionEvent>,
    ) -> Option<VerificationTicket> {
        let expired = inner
            .pending
            .as_ref()
            .is_some_and(|p| p.ticket.is_expired_at(now));
        if !expired {
            return None;
        }
        let ticket = inner.take_pending()?.ticket.with_state(TicketState::Expired);
        if inner.state == SessionState::PendingStepUp {
            inner.state = SessionState::Active;
            events.push(SessionEvent::StateChanged(SessionState::Active));
        }
        self.publish(inner);
        info!(ticket = %ticket.id(), "Step-up ticket expired");
        events.push(SessionEvent::SuppressPrompt(PromptSuppression::for_ticket(
            ticket.id().clone(),
        )));
        Some(ticket)
    }

    /// Bring the vault back in line with the committed state after a discarded write
    fn restore_vault(&self, current: Option<&SessionRecord>) {
        let result = match current {
            Some(record) => self.vault.persist(record),
            None => self.vault.clear(),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to restore vault after discarded approval");
        }
    }

    fn publish(&self, inner: &mut MutexGuard<'_, Inner>) {
        inner.epoch += 1;
        self.snapshot_tx.send_replace(inner.snapshot());
    }

    fn dispatch(&self, events: Vec<SessionEvent>) {
        for event in &events {
            self.observers.dispatch(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block vault-writing transitions until the guard drops
    #[cfg(test)]
    pub(crate) fn hold_write_gate(&self) -> MutexGuard<'_, ()> {
        self.gate()
    }
}
