//! Composition root: builds every component from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::info;

use sessionguard_core::vault::{
    DerivedKeyProvider, FallbackKeyProvider, FileStore, KeyValueStore, KeychainKeyProvider,
};
use sessionguard_core::{
    Clock, CredentialVault, HttpIdentityService, IdentityService, PushApprovalGateway,
    SessionConfig, SessionStateMachine, SystemClock, Verifier,
};

/// Keychain account holding the vault key
const KEYCHAIN_ACCOUNT: &str = "vault-key";

pub struct App {
    pub config: SessionConfig,
    pub store: Arc<dyn KeyValueStore>,
    pub vault: Arc<CredentialVault>,
    pub machine: Arc<SessionStateMachine>,
    pub clock: Arc<dyn Clock>,
}

impl App {
    /// Open the vault and restore any persisted session
    pub fn new(config: SessionConfig) -> Result<Self> {
        let store_path = config.store_path()?;
        let store: Arc<dyn KeyValueStore> = Arc::new(
            FileStore::new(&store_path)
                .with_context(|| format!("Failed to open store at {}", store_path.display()))?,
        );

        let keys = FallbackKeyProvider::new(
            Box::new(KeychainKeyProvider::new(
                config.keyring_service.as_str(),
                KEYCHAIN_ACCOUNT,
            )),
            Box::new(DerivedKeyProvider::new(
                store.clone(),
                config.device_secret.clone(),
            )),
        );
        let vault = Arc::new(CredentialVault::new(store.clone(), Arc::new(keys)));

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let machine = Arc::new(SessionStateMachine::new(vault.clone(), clock.clone()));
        let state = machine.restore();
        info!(?state, store = %store_path.display(), "Session engine ready");

        Ok(Self {
            config,
            store,
            vault,
            machine,
            clock,
        })
    }

    pub fn identity(&self) -> Result<Arc<dyn IdentityService>> {
        let base_url = self.config.api_base_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("No identity service configured (set SESSIONGUARD_API_URL)")
        })?;
        let service =
            HttpIdentityService::new(base_url, self.machine.subscribe(), self.clock.clone())?;
        Ok(Arc::new(service))
    }

    pub fn verifier(&self, identity: Arc<dyn IdentityService>) -> Verifier {
        Verifier::new(
            self.machine.clone(),
            identity,
            self.store.clone(),
            self.clock.clone(),
            self.config.verification_interval(),
        )
    }

    pub fn gateway(&self, identity: Arc<dyn IdentityService>) -> PushApprovalGateway {
        PushApprovalGateway::new(self.machine.clone(), identity, self.config.action_labels())
    }

    /// Session summary for display; never includes credentials
    pub fn status(&self) -> Value {
        let snapshot = self.machine.snapshot();
        let expiration = snapshot.record.as_ref().map(|r| r.expiration_time());

        json!({
            "state": snapshot.state,
            "valid": self.machine.is_valid(),
            "expires_at": expiration.map(format_expiration),
            "pending_ticket": snapshot.pending_ticket.as_ref().map(|ticket| json!({
                "id": ticket.id().as_str(),
                "expires_at": format_millis(ticket.expires_at()),
            })),
            "stored": self.vault.has_stored_session(),
        })
    }
}

fn format_expiration(millis: i64) -> String {
    if millis == 0 {
        "never".to_string()
    } else {
        format_millis(millis)
    }
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}
