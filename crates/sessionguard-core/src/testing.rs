//! Shared wiring for component tests.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::ManualClock;
use crate::models::{SessionRecord, VerificationTicket};
use crate::session::observer::RecordingObserver;
use crate::session::SessionStateMachine;
use crate::vault::keys::StaticKeyProvider;
use crate::vault::{CredentialVault, KeyValueStore, MemoryStore};

pub(crate) const NOW: i64 = 1_700_000_000_000;
pub(crate) const TICKET_TTL: Duration = Duration::from_secs(120);

pub(crate) struct Harness {
    pub(crate) machine: Arc<SessionStateMachine>,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) vault: Arc<CredentialVault>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) observer: Arc<RecordingObserver>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let vault = Arc::new(CredentialVault::new(
            store.clone(),
            Arc::new(StaticKeyProvider::new("static", 9)),
        ));
        let clock = Arc::new(ManualClock::new(NOW));
        let machine = Arc::new(SessionStateMachine::new(vault.clone(), clock.clone()));
        let observer = Arc::new(RecordingObserver::default());
        machine.register_observer(observer.clone());
        Self {
            machine,
            store,
            vault,
            clock,
            observer,
        }
    }

    pub(crate) fn active() -> Self {
        let harness = Self::new();
        harness
            .machine
            .login(SessionRecord::new("T1", "S1", 0))
            .unwrap();
        harness
    }

    pub(crate) fn pending(ticket_id: &str) -> Self {
        let harness = Self::active();
        harness
            .machine
            .request_step_up(VerificationTicket::new(ticket_id.into(), NOW, TICKET_TTL))
            .unwrap();
        harness
    }
}
