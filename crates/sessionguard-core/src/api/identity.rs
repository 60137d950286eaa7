use futures::future::BoxFuture;

use crate::error::RemoteError;
use crate::models::SessionRecord;

/// Remote identity provider the session is checked against.
///
/// Implementations report transport trouble as `RemoteError::Network` and an
/// explicit refusal as `RemoteError::Rejected`; only the latter drops a session.
pub trait IdentityService: Send + Sync {
    /// Ask the provider whether the current session is still honoured
    fn verify_session(&self) -> BoxFuture<'_, Result<(), RemoteError>>;

    /// Trade an approval token from a push prompt for an upgraded session
    fn exchange_step_up_token<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, Result<SessionRecord, RemoteError>>;
}

#[cfg(test)]
pub(crate) use scripted::ScriptedIdentity;
