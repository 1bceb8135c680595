use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use shared::error::RemoteError;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    config::AuthSettings,
    remote::{Credential, CredentialProvider},
};

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, RemoteError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    NoCredential,
    RefreshTimedOut,
    RefreshRejected,
    /// The refresh endpoint could not be reached.
    RefreshFailed,
    /// A write was refused with the current credential.
    CredentialRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthDecision {
    pub can_write: bool,
    pub reason: Option<BlockReason>,
}

impl AuthDecision {
    pub fn allowed() -> Self {
        Self {
            can_write: true,
            reason: None,
        }
    }

    pub fn blocked(reason: BlockReason) -> Self {
        Self {
            can_write: false,
            reason: Some(reason),
        }
    }
}

/// Decides whether a remote write may go out with the current credential.
///
/// Reads and subscriptions never wait on this gate. At most one refresh is
/// in flight; it runs on its own task so a caller that gives up after its
/// timeout still lets the refresh land in the cache.
pub struct AuthGate {
    provider: Arc<dyn CredentialProvider>,
    settings: AuthSettings,
    cached: Mutex<Option<Credential>>,
    inflight: Mutex<Option<RefreshFuture>>,
    writes_blocked: watch::Sender<bool>,
}

impl AuthGate {
    pub fn new(provider: Arc<dyn CredentialProvider>, settings: AuthSettings) -> Arc<Self> {
        let (writes_blocked, _) = watch::channel(false);
        Arc::new(Self {
            provider,
            settings,
            cached: Mutex::new(None),
            inflight: Mutex::new(None),
            writes_blocked,
        })
    }

    pub fn writes_blocked(&self) -> bool {
        *self.writes_blocked.borrow()
    }

    pub fn subscribe_writes_blocked(&self) -> watch::Receiver<bool> {
        self.writes_blocked.subscribe()
    }

    pub fn refresh_timeout(&self) -> Duration {
        self.settings.refresh_timeout
    }

    pub async fn ensure_writable(self: &Arc<Self>, timeout: Duration) -> AuthDecision {
        let current = self.cached_credential().await;
        if let Some(credential) = &current {
            if self.is_fresh(credential, Utc::now()) {
                self.set_blocked(false);
                return AuthDecision::allowed();
            }
        }

        let refresh = self.start_refresh().await;
        let decision = match tokio::time::timeout(timeout, refresh).await {
            Ok(Ok(_)) => AuthDecision::allowed(),
            Ok(Err(err)) if current.is_none() => {
                debug!(error = %err, "auth: refresh failed without a prior credential");
                AuthDecision::blocked(BlockReason::NoCredential)
            }
            Ok(Err(RemoteError::AuthExpired(_) | RemoteError::Validation(_))) => {
                AuthDecision::blocked(BlockReason::RefreshRejected)
            }
            Ok(Err(_)) => AuthDecision::blocked(BlockReason::RefreshFailed),
            Err(_) => AuthDecision::blocked(BlockReason::RefreshTimedOut),
        };

        self.set_blocked(!decision.can_write);
        if let Some(reason) = decision.reason {
            info!(?reason, timeout_ms = timeout.as_millis() as u64, "auth: writes blocked");
        }
        decision
    }

    /// Last-known-good credential for a reconnect attempt. Never waits on a
    /// refresh; one is started in the background when expiry is near.
    pub async fn credential_for_connect(self: &Arc<Self>) -> Option<Credential> {
        let current = self.cached_credential().await;
        let needs_refresh = current
            .as_ref()
            .map_or(true, |credential| !self.is_fresh(credential, Utc::now()));
        if needs_refresh {
            drop(self.start_refresh().await);
        }
        current
    }

    /// Marks the cached credential as expired after the remote rejected it.
    pub async fn invalidate(&self) {
        if let Some(credential) = self.cached.lock().await.as_mut() {
            credential.expires_at = Some(Utc::now());
        }
        self.set_blocked(true);
        warn!("auth: credential rejected by remote, writes blocked until refresh");
    }

    async fn cached_credential(&self) -> Option<Credential> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = self.provider.current().await.map(with_token_expiry);
        }
        cached.clone()
    }

    fn is_fresh(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        let Some(expires_at) = credential.expires_at else {
            return true;
        };
        match (expires_at - now).to_std() {
            Ok(remaining) => remaining > self.settings.validity_threshold,
            Err(_) => false,
        }
    }

    async fn start_refresh(self: &Arc<Self>) -> RefreshFuture {
        let mut inflight = self.inflight.lock().await;
        if let Some(refresh) = inflight.as_ref() {
            return refresh.clone();
        }

        let gate = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = gate.provider.refresh().await.map(with_token_expiry);
            match &result {
                Ok(credential) => {
                    *gate.cached.lock().await = Some(credential.clone());
                    gate.set_blocked(false);
                    info!(expires_at = ?credential.expires_at, "auth: credential refreshed");
                }
                Err(err) => warn!(error = %err, "auth: credential refresh failed"),
            }
            *gate.inflight.lock().await = None;
            result
        });
        let refresh = async move {
            task.await
                .unwrap_or_else(|err| Err(RemoteError::Network(format!("refresh task failed: {err}"))))
        }
        .boxed()
        .shared();
        *inflight = Some(refresh.clone());
        refresh
    }

    fn set_blocked(&self, blocked: bool) {
        self.writes_blocked.send_if_modified(|current| {
            let changed = *current != blocked;
            *current = blocked;
            changed
        });
    }
}

fn with_token_expiry(mut credential: Credential) -> Credential {
    if credential.expires_at.is_none() {
        credential.expires_at = token_expiry(&credential.access_token);
    }
    credential
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<i64>,
}

/// Reads the `exp` claim of a JWT access token. The signature is not checked;
/// the server remains the authority on validity.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data =
        jsonwebtoken::decode::<ExpiryClaim>(token, &DecodingKey::from_secret(&[]), &validation)
            .ok()?;
    DateTime::from_timestamp(data.claims.exp?, 0)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
