//! HTTP adapter for the identity service.
//!
//! Every endpoint is a form POST answering a JSON envelope whose `errorCode`
//! is 0 on success. The session token is taken from the live session snapshot
//! on each call, so the adapter never holds credentials of its own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::IdentityService;
use crate::clock::Clock;
use crate::error::RemoteError;
use crate::models::SessionRecord;
use crate::session::SessionSnapshot;

/// HTTP request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 30;

const VERIFY_LOGIN_ENDPOINT: &str = "accounts.verifyLogin";
const PUSH_VERIFY_ENDPOINT: &str = "accounts.auth.push.verify";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "errorCode", default)]
    error_code: i64,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
    #[serde(rename = "errorDetails", default)]
    error_details: Option<String>,
    #[serde(rename = "sessionInfo", default)]
    session_info: Option<SessionInfo>,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    #[serde(rename = "sessionToken")]
    session_token: String,
    #[serde(rename = "sessionSecret")]
    session_secret: String,
    /// Lifetime in seconds; sent as a number or a numeric string
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl SessionInfo {
    fn expires_in_secs(&self) -> i64 {
        match &self.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }
}

impl Envelope {
    fn into_result(self) -> Result<Self, RemoteError> {
        if self.error_code == 0 {
            return Ok(self);
        }
        let message = self
            .error_details
            .as_deref()
            .or(self.error_message.as_deref())
            .unwrap_or("")
            .to_string();
        Err(RemoteError::rejected(self.error_code, message))
    }
}

/// Identity service reached over HTTPS.
pub struct HttpIdentityService {
    client: Client,
    base_url: String,
    session: watch::Receiver<SessionSnapshot>,
    clock: Arc<dyn Clock>,
}

impl HttpIdentityService {
    pub fn new(
        base_url: impl Into<String>,
        session: watch::Receiver<SessionSnapshot>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            clock,
        })
    }

    fn current_token(&self) -> Option<String> {
        self.session
            .borrow()
            .record
            .as_ref()
            .map(|record| record.token().to_string())
    }

    /// Check if response is successful, returning a classified error if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status, &body))
        }
    }

    async fn post_form(&self, endpoint: &str, form: &[(&str, &str)]) -> Result<Envelope, RemoteError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!(endpoint, "Identity request");

        let response = self.client.post(&url).form(form).send().await?;
        let response = Self::check_response(response).await?;
        let envelope: Envelope = response.json().await.map_err(|e| {
            warn!(endpoint, error = %e, "Unparsable identity response");
            RemoteError::Network(format!("Invalid response from {}: {}", endpoint, e))
        })?;
        envelope.into_result()
    }

    async fn verify(&self) -> Result<(), RemoteError> {
        let token = self
            .current_token()
            .ok_or_else(|| RemoteError::Network("No session to verify".to_string()))?;
        self.post_form(VERIFY_LOGIN_ENDPOINT, &[("oauth_token", token.as_str())])
            .await?;
        Ok(())
    }

    async fn exchange(&self, verification_token: &str) -> Result<SessionRecord, RemoteError> {
        let token = self.current_token().unwrap_or_default();
        let mut form = vec![("verificationToken", verification_token)];
        if !token.is_empty() {
            form.push(("oauth_token", token.as_str()));
        }

        let envelope = self.post_form(PUSH_VERIFY_ENDPOINT, &form).await?;
        let info = envelope.session_info.ok_or_else(|| {
            RemoteError::Network("Push verification response without session".to_string())
        })?;
        Ok(SessionRecord::expiring_in(
            info.session_token.as_str(),
            info.session_secret.as_str(),
            info.expires_in_secs(),
            self.clock.now_millis(),
        ))
    }
}

impl IdentityService for HttpIdentityService {
    fn verify_session(&self) -> BoxFuture<'_, Result<(), RemoteError>> {
        Box::pin(self.verify())
    }

    fn exchange_step_up_token<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, Result<SessionRecord, RemoteError>> {
        Box::pin(self.exchange(token))
    }
}
