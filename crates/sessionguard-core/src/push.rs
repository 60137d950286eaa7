//! Second-channel approval of step-up tickets.
//!
//! A push notification carries the user's decision on a step-up prompt. The
//! gateway validates the payload, withdraws the displayed prompt, and drives
//! the ticket to a resolution through the state machine. Approvals go through
//! a ticket claim first, so of two deliveries for the same ticket only one
//! reaches the identity service.
//!
//! Payloads need not name their ticket. Such an event applies to the pending
//! ticket, or to the one most recently resolved or expired, so a decision
//! that arrives late is reported as stale rather than dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::api::IdentityService;
use crate::error::SessionError;
use crate::models::{TicketId, VerificationTicket};
use crate::session::{PromptSuppression, SessionStateMachine, StepUpOutcome};

/// The only push mode that carries a step-up decision
pub const VERIFY_MODE: &str = "verify";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAction {
    Approve,
    Deny,
}

/// Maps notification action labels to decisions.
///
/// Labels come from the embedding application (they are usually localized
/// button titles). Matching is exact after trimming whitespace.
#[derive(Debug, Clone, Default)]
pub struct ActionLabels {
    approve: Vec<String>,
    deny: Vec<String>,
}

impl ActionLabels {
    pub fn new<A, D>(approve: A, deny: D) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            approve: approve.into_iter().map(Into::into).collect(),
            deny: deny.into_iter().map(Into::into).collect(),
        }
    }

    /// A label listed under both decisions resolves to `Deny`.
    pub fn resolve(&self, label: &str) -> Option<PushAction> {
        let label = label.trim();
        if self.deny.iter().any(|l| l == label) {
            Some(PushAction::Deny)
        } else if self.approve.iter().any(|l| l == label) {
            Some(PushAction::Approve)
        } else {
            None
        }
    }
}

/// Inbound push payload
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PushEvent {
    pub mode: Option<String>,
    pub action: Option<String>,
    pub ticket_token: Option<String>,
    /// Targets the single pending ticket when absent
    pub ticket_id: Option<TicketId>,
    pub notification_id: Option<i64>,
}

impl PushEvent {
    /// Parse a flat string map as delivered by push data messages
    pub fn from_payload(payload: &HashMap<String, String>) -> Self {
        let field = |key: &str| {
            payload
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let notification_id = field("notificationId").and_then(|raw| match raw.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                debug!(value = %raw, "Dropping unparsable notification id");
                None
            }
        });

        Self {
            mode: field("mode"),
            action: field("action"),
            ticket_token: field("ticketToken").or_else(|| field("vToken")),
            ticket_id: field("ticketId").map(TicketId::new),
            notification_id,
        }
    }
}

impl fmt::Debug for PushEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushEvent")
            .field("mode", &self.mode)
            .field("action", &self.action)
            .field("ticket_token", &self.ticket_token.as_ref().map(|_| "[REDACTED]"))
            .field("ticket_id", &self.ticket_id)
            .field("notification_id", &self.notification_id)
            .finish()
    }
}

/// What a handled event did to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Approved(VerificationTicket),
    Denied(VerificationTicket),
    /// Unsupported mode, or no step-up was ever issued
    Ignored,
}

pub struct PushApprovalGateway {
    machine: Arc<SessionStateMachine>,
    identity: Arc<dyn IdentityService>,
    labels: ActionLabels,
}

impl PushApprovalGateway {
    pub fn new(
        machine: Arc<SessionStateMachine>,
        identity: Arc<dyn IdentityService>,
        labels: ActionLabels,
    ) -> Self {
        Self {
            machine,
            identity,
            labels,
        }
    }

    pub async fn handle(&self, event: PushEvent) -> Result<PushOutcome, SessionError> {
        let ticket_id = event
            .ticket_id
            .clone()
            .or_else(|| self.machine.resolution_target());

        if ticket_id.is_some() || event.notification_id.is_some() {
            self.machine.request_prompt_suppression(PromptSuppression {
                ticket_id: ticket_id.clone(),
                notification_id: event.notification_id,
            });
        }

        let Some(mode) = event.mode.as_deref() else {
            warn!("Push event without mode");
            return Err(SessionError::MalformedExternalEvent("missing mode".to_string()));
        };
        if mode != VERIFY_MODE {
            warn!(mode, "Unsupported push mode, ignoring");
            return Ok(PushOutcome::Ignored);
        }

        let action = event
            .action
            .as_deref()
            .and_then(|label| self.labels.resolve(label))
            .ok_or_else(|| {
                warn!(action = ?event.action, "Unrecognized push action");
                SessionError::MalformedExternalEvent("unrecognized action".to_string())
            })?;

        let token = match action {
            PushAction::Approve => Some(event.ticket_token.as_deref().ok_or_else(|| {
                warn!("Approval without ticket token");
                SessionError::MalformedExternalEvent("missing ticket token".to_string())
            })?),
            PushAction::Deny => None,
        };

        let Some(ticket_id) = ticket_id else {
            info!("No step-up issued for push event");
            return Ok(PushOutcome::Ignored);
        };

        match token {
            None => {
                let ticket = self.resolve(&ticket_id, StepUpOutcome::Denied).await?;
                Ok(PushOutcome::Denied(ticket))
            }
            Some(token) => self.approve(&ticket_id, token).await,
        }
    }

    async fn approve(&self, ticket_id: &TicketId, token: &str) -> Result<PushOutcome, SessionError> {
        self.machine.claim_ticket(ticket_id)?;

        let record = match self.identity.exchange_step_up_token(token).await {
            Ok(record) => record,
            Err(e) => {
                warn!(ticket = %ticket_id, error = %e, "Step-up token exchange failed");
                self.machine.release_claim(ticket_id);
                return Err(e.into());
            }
        };

        let ticket = self
            .resolve(ticket_id, StepUpOutcome::Approved(record))
            .await?;
        Ok(PushOutcome::Approved(ticket))
    }

    /// Resolutions write the vault, so they run on the blocking pool
    async fn resolve(
        &self,
        ticket_id: &TicketId,
        outcome: StepUpOutcome,
    ) -> Result<VerificationTicket, SessionError> {
        let machine = Arc::clone(&self.machine);
        let ticket_id = ticket_id.clone();
        tokio::task::spawn_blocking(move || machine.resolve_step_up(&ticket_id, outcome))
            .await
            .map_err(|e| SessionError::Storage(format!("resolution task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api::ScriptedIdentity;
    use crate::error::RemoteError;
    use crate::models::{SessionRecord, TicketState};
    use crate::session::SessionState;
    use crate::testing::Harness;

    fn labels() -> ActionLabels {
        ActionLabels::new(["Approve", "Genehmigen"], ["Deny", "Ablehnen"])
    }

    fn gateway(harness: &Harness, identity: Arc<ScriptedIdentity>) -> PushApprovalGateway {
        PushApprovalGateway::new(harness.machine.clone(), identity, labels())
    }

    fn event(action: &str, ticket: &str, token: Option<&str>) -> PushEvent {
        PushEvent {
            mode: Some(VERIFY_MODE.to_string()),
            action: Some(action.to_string()),
            ticket_token: token.map(str::to_string),
            ticket_id: Some(ticket.into()),
            notification_id: None,
        }
    }

    #[test]
    fn test_from_payload() {
        let payload: HashMap<String, String> = [
            ("mode", "verify"),
            ("action", " Approve "),
            ("vToken", "vt-1"),
            ("ticketId", "X"),
            ("notificationId", "42"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let event = PushEvent::from_payload(&payload);
        assert_eq!(event.mode.as_deref(), Some("verify"));
        assert_eq!(event.action.as_deref(), Some("Approve"));
        assert_eq!(event.ticket_token.as_deref(), Some("vt-1"));
        assert_eq!(event.ticket_id, Some(TicketId::from("X")));
        assert_eq!(event.notification_id, Some(42));
        assert!(!format!("{:?}", event).contains("vt-1"));
    }

    #[test]
    fn test_from_payload_drops_bad_notification_id() {
        let payload: HashMap<String, String> =
            [("notificationId".to_string(), "abc".to_string())].into();
        let event = PushEvent::from_payload(&payload);
        assert_eq!(event.notification_id, None);
        assert_eq!(event.mode, None);
    }

    #[test]
    fn test_labels_resolve() {
        let labels = labels();
        assert_eq!(labels.resolve("Genehmigen"), Some(PushAction::Approve));
        assert_eq!(labels.resolve("Ablehnen"), Some(PushAction::Deny));
        assert_eq!(labels.resolve("approve"), None);

        let overlapping = ActionLabels::new(["OK"], ["OK"]);
        assert_eq!(overlapping.resolve("OK"), Some(PushAction::Deny));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_approvals_resolve_once() {
        let harness = Harness::pending("X");
        let identity = Arc::new(ScriptedIdentity {
            exchange_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let gateway = gateway(&harness, identity.clone());

        let (first, second) = futures::join!(
            gateway.handle(event("Approve", "X", Some("vt-1"))),
            gateway.handle(event("Approve", "X", Some("vt-1"))),
        );

        let outcomes = [first, second];
        let approved = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(PushOutcome::Approved(_))))
            .count();
        let stale = outcomes
            .iter()
            .filter(|o| matches!(o, Err(SessionError::StaleTicket(_))))
            .count();
        assert_eq!((approved, stale), (1, 1));
        assert_eq!(identity.exchange_calls(), 1);
        assert_eq!(harness.machine.state(), SessionState::Active);
        assert_eq!(
            harness.vault.load(),
            Some(SessionRecord::new("T-up", "S-up", 0))
        );
    }

    #[tokio::test]
    async fn test_deny_then_approve_is_stale() {
        let harness = Harness::pending("X");
        let identity = Arc::new(ScriptedIdentity::default());
        let gateway = gateway(&harness, identity.clone());

        let denied = gateway.handle(event("Ablehnen", "X", None)).await.unwrap();
        match denied {
            PushOutcome::Denied(ticket) => assert_eq!(ticket.state(), TicketState::Denied),
            other => panic!("expected denial, got {:?}", other),
        }
        assert_eq!(harness.machine.state(), SessionState::Invalid);

        let err = gateway
            .handle(event("Approve", "X", Some("vt-1")))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::StaleTicket("X".into()));
        assert_eq!(identity.exchange_calls(), 0);
        assert_eq!(harness.observer.invalidations(), 1);
    }

    #[tokio::test]
    async fn test_approve_without_token_is_malformed() {
        let harness = Harness::pending("X");
        let identity = Arc::new(ScriptedIdentity::default());
        let gateway = gateway(&harness, identity.clone());
        let before = harness.machine.snapshot().epoch;

        let err = gateway.handle(event("Approve", "X", None)).await.unwrap_err();
        assert!(matches!(err, SessionError::MalformedExternalEvent(_)));
        assert_eq!(harness.machine.state(), SessionState::PendingStepUp);
        assert_eq!(harness.machine.snapshot().epoch, before);
        assert_eq!(identity.exchange_calls(), 0);
        // The prompt is withdrawn regardless
        assert_eq!(harness.observer.suppressions().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_mode_is_ignored() {
        let harness = Harness::pending("X");
        let gateway = gateway(&harness, Arc::new(ScriptedIdentity::default()));
        let mut event = event("Approve", "X", Some("vt-1"));
        event.mode = Some("optin".to_string());

        assert_eq!(gateway.handle(event).await, Ok(PushOutcome::Ignored));
        assert_eq!(harness.machine.state(), SessionState::PendingStepUp);
    }

    #[tokio::test]
    async fn test_missing_mode_and_unknown_action_are_malformed() {
        let harness = Harness::pending("X");
        let gateway = gateway(&harness, Arc::new(ScriptedIdentity::default()));

        let mut no_mode = event("Approve", "X", Some("vt-1"));
        no_mode.mode = None;
        assert!(matches!(
            gateway.handle(no_mode).await,
            Err(SessionError::MalformedExternalEvent(_))
        ));

        assert!(matches!(
            gateway.handle(event("Maybe", "X", Some("vt-1"))).await,
            Err(SessionError::MalformedExternalEvent(_))
        ));
        assert_eq!(harness.machine.state(), SessionState::PendingStepUp);
    }

    #[tokio::test]
    async fn test_failed_exchange_can_be_retried() {
        let harness = Harness::pending("X");
        let identity = Arc::new(ScriptedIdentity::default());
        identity.push_exchange(Err(RemoteError::Network("timeout".into())));
        let gateway = gateway(&harness, identity.clone());

        let err = gateway
            .handle(event("Approve", "X", Some("vt-1")))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(harness.machine.state(), SessionState::PendingStepUp);

        let outcome = gateway
            .handle(event("Approve", "X", Some("vt-1")))
            .await
            .unwrap();
        assert!(matches!(outcome, PushOutcome::Approved(_)));
        assert_eq!(identity.exchange_calls(), 2);
    }

    fn payload(entries: &[(&str, &str)]) -> PushEvent {
        let payload: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PushEvent::from_payload(&payload)
    }

    #[tokio::test]
    async fn test_event_without_ticket_targets_pending() {
        let harness = Harness::pending("X");
        let identity = Arc::new(ScriptedIdentity::default());
        let gateway = gateway(&harness, identity.clone());

        let deny = payload(&[("mode", "verify"), ("action", "Deny")]);
        assert_eq!(deny.ticket_id, None);
        let outcome = gateway.handle(deny).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Denied(_)));

        // A late approval for the same prompt finds its ticket already resolved
        let approve = payload(&[
            ("mode", "verify"),
            ("action", "Approve"),
            ("ticketToken", "vt-1"),
        ]);
        assert_eq!(
            gateway.handle(approve).await,
            Err(SessionError::StaleTicket("X".into()))
        );
        assert_eq!(identity.exchange_calls(), 0);
        assert_eq!(harness.machine.state(), SessionState::Invalid);
        assert_eq!(harness.observer.invalidations(), 1);
    }

    #[tokio::test]
    async fn test_event_after_ticket_expiry_is_stale() {
        let harness = Harness::pending("X");
        harness.clock.advance_millis(crate::testing::TICKET_TTL.as_millis() as i64);
        let gateway = gateway(&harness, Arc::new(ScriptedIdentity::default()));

        let deny = payload(&[("mode", "verify"), ("action", "Deny")]);
        assert_eq!(
            gateway.handle(deny).await,
            Err(SessionError::StaleTicket("X".into()))
        );
        assert_eq!(harness.machine.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_event_without_any_ticket_is_ignored() {
        let harness = Harness::active();
        let gateway = gateway(&harness, Arc::new(ScriptedIdentity::default()));

        let deny = payload(&[("mode", "verify"), ("action", "Deny")]);
        assert_eq!(gateway.handle(deny).await, Ok(PushOutcome::Ignored));
        assert_eq!(harness.machine.state(), SessionState::Active);
    }
}
