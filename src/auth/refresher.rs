//! Background credential renewal
//!
//! State machine:
//!
//! ```text
//! Unauthenticated ──authorize──▶ Valid ──near expiry──▶ Refreshing ──ok──▶ Valid
//!                                  ▲                        │
//!                                  │                 rejected / refresh expired
//!                                  └──── authorize ──── ExpiredNeedsReauth
//! ```
//!
//! All credential mutations go through one mutex. Only one token exchange runs
//! at a time; callers that need a new token while one is in flight wait on the
//! `generation` watch channel instead of starting their own.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    unix_now, AccessTokenSource, AuthState, AuthorizationCodeProvider, Credential,
    CredentialStore, TokenEndpoint,
};
use crate::config::RefreshConfig;
use crate::error::AuthError;
use crate::shutdown::SharedShutdown;

#[derive(Debug)]
struct Inner {
    credential: Option<Credential>,
    status: AuthState,
    exchange_in_flight: bool,
}

enum Claim {
    Acquired(Option<Credential>),
    Busy(watch::Receiver<u64>),
    /// The caller's token was already replaced
    Superseded,
}

/// Owns the credential and keeps it fresh
pub struct CredentialRefresher {
    state: Mutex<Inner>,
    generation: watch::Sender<u64>,
    store: CredentialStore,
    endpoint: Arc<dyn TokenEndpoint>,
    code_provider: Arc<dyn AuthorizationCodeProvider>,
    config: RefreshConfig,
}

impl CredentialRefresher {
    pub fn new(
        store: CredentialStore,
        endpoint: Arc<dyn TokenEndpoint>,
        code_provider: Arc<dyn AuthorizationCodeProvider>,
        config: RefreshConfig,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: Mutex::new(Inner {
                credential: None,
                status: AuthState::Unauthenticated,
                exchange_in_flight: false,
            }),
            generation,
            store,
            endpoint,
            code_provider,
            config,
        }
    }

    /// Load the stored credential and bring it to `Valid`, refreshing or fully
    /// authorizing as needed.
    pub async fn initialize(&self) -> Result<(), AuthError> {
        let loaded = self.store.load();
        let now = unix_now();
        let status = {
            let mut state = self.state.lock().await;
            state.status = match &loaded {
                Some(c) if c.refresh_valid_at(now) => AuthState::Valid,
                Some(_) => AuthState::ExpiredNeedsReauth,
                None => AuthState::Unauthenticated,
            };
            state.credential = loaded;
            state.status
        };

        match status {
            AuthState::Valid => self.renew_if_due().await,
            _ => {
                info!(?status, "Authorization required");
                self.authorize().await
            }
        }
    }

    pub async fn state(&self) -> AuthState {
        self.state.lock().await.status
    }

    /// Latest known access token, even if a renewal is in flight
    pub async fn current_token(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .credential
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    pub async fn snapshot(&self) -> Option<Credential> {
        self.state.lock().await.credential.clone()
    }

    /// No usable token and nothing in flight that could produce one
    pub async fn is_exhausted(&self) -> bool {
        let state = self.state.lock().await;
        if state.exchange_in_flight {
            return false;
        }
        match (&state.credential, state.status) {
            (None, _) => true,
            (Some(c), AuthState::ExpiredNeedsReauth) => !c.access_valid_at(unix_now()),
            _ => false,
        }
    }

    /// Obtain a token different from `stale`, refreshing once if needed.
    pub async fn force_refresh(&self, stale: &str) -> Result<String, AuthError> {
        self.refresh(Some(stale)).await?;
        match self.current_token().await {
            Some(token) if token != stale => Ok(token),
            _ => Err(AuthError::Unavailable),
        }
    }

    /// One poll of the background loop
    pub async fn tick(&self) {
        let result = match self.state().await {
            AuthState::Unauthenticated | AuthState::ExpiredNeedsReauth => self.authorize().await,
            AuthState::Valid | AuthState::Refreshing => self.renew_if_due().await,
        };
        if let Err(e) = result {
            warn!(error = %e, "[REFRESH] Credential renewal failed, will retry later");
        }
    }

    /// Run [`Self::tick`] every poll interval until shutdown. Returns promptly
    /// on shutdown even while a tick is blocked on authorization.
    pub fn spawn(self: Arc<Self>, shutdown: SharedShutdown) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                poll_secs = self.config.poll_interval.as_secs_f64(),
                margin_secs = self.config.safety_margin.as_secs(),
                "🔑 Token refresh loop started"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.wait_for_shutdown() => break,
                }
                // A renewal may wait on a human; shutdown must not wait with it.
                // The exchange itself is never cancelled halfway.
                let this = self.clone();
                let mut renewal = tokio::spawn(async move { this.tick().await });
                tokio::select! {
                    _ = &mut renewal => {}
                    _ = shutdown.wait_for_shutdown() => {
                        debug!("Shutdown during credential renewal, leaving it detached");
                        break;
                    }
                }
            }
            debug!("Token refresh loop stopped");
        })
    }

    async fn renew_if_due(&self) -> Result<(), AuthError> {
        let now = unix_now();
        let due = {
            let state = self.state.lock().await;
            match &state.credential {
                Some(c) => !c.refresh_valid_at(now) || c.needs_renewal_at(now, self.config.safety_margin),
                None => true,
            }
        };
        if !due {
            return Ok(());
        }

        match self.refresh(None).await {
            Ok(()) => Ok(()),
            Err(e) if self.state().await == AuthState::ExpiredNeedsReauth => {
                warn!(error = %e, "Refresh token unusable, falling back to full authorization");
                self.authorize().await
            }
            Err(e) => {
                let still_usable = self
                    .snapshot()
                    .await
                    .map(|c| c.access_valid_at(unix_now()))
                    .unwrap_or(false);
                if still_usable {
                    warn!(error = %e, "Token refresh failed, current access token still valid");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Exchange the refresh token for a new access token, unless the current
    /// one already differs from `stale`
    async fn refresh(&self, stale: Option<&str>) -> Result<(), AuthError> {
        let previous = match self.claim(true, stale).await {
            Claim::Superseded => return Ok(()),
            Claim::Busy(rx) => return self.wait_for_exchange(rx).await,
            Claim::Acquired(Some(c)) if c.refresh_valid_at(unix_now()) => c,
            Claim::Acquired(_) => {
                self.release(AuthState::ExpiredNeedsReauth).await;
                return Err(AuthError::Unavailable);
            }
        };

        info!("[REFRESH] Access token needs refresh");
        let result = self
            .endpoint
            .refresh(&previous.refresh_token)
            .await
            .and_then(|grant| {
                Credential::from_grant(grant, Some(&previous), self.config.refresh_lifetime, unix_now())
            });

        match result {
            Ok(credential) => {
                self.install(credential).await;
                info!("Access token refreshed successfully");
                Ok(())
            }
            Err(e) => {
                let next = if e.is_rejection() {
                    AuthState::ExpiredNeedsReauth
                } else {
                    AuthState::Valid
                };
                self.release(next).await;
                Err(e)
            }
        }
    }

    /// Full authorization-code exchange, retried with backoff
    async fn authorize(&self) -> Result<(), AuthError> {
        let previous = match self.claim(false, None).await {
            Claim::Superseded => return Ok(()),
            Claim::Busy(rx) => return self.wait_for_exchange(rx).await,
            Claim::Acquired(previous) => previous,
        };

        let attempts = self.config.authorize_attempts.max(1);
        let mut last_error = AuthError::Unavailable;

        for attempt in 0..attempts {
            match self.authorize_once(previous.as_ref()).await {
                Ok(credential) => {
                    self.install(credential).await;
                    info!("✅ Authorization successful");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, attempts, error = %e, "Authorization attempt failed");
                    last_error = e;
                    if attempt + 1 < attempts {
                        let delay = self
                            .config
                            .authorize_retry_delay
                            .saturating_mul(2u32.saturating_pow(attempt));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!(error = %last_error, "Failed to obtain an access token");
        let next = if previous.is_some() {
            AuthState::ExpiredNeedsReauth
        } else {
            AuthState::Unauthenticated
        };
        self.release(next).await;
        Err(last_error)
    }

    async fn authorize_once(&self, previous: Option<&Credential>) -> Result<Credential, AuthError> {
        let code = self
            .code_provider
            .obtain_code(&self.endpoint.authorize_url())
            .await?;
        let grant = self.endpoint.exchange_code(&code).await?;
        Credential::from_grant(grant, previous, self.config.refresh_lifetime, unix_now())
    }

    /// Take the exchange slot, or a receiver to wait on the one in flight
    async fn claim(&self, refreshing: bool, stale: Option<&str>) -> Claim {
        let mut state = self.state.lock().await;
        if let (Some(stale), Some(current)) = (stale, &state.credential) {
            if current.access_token != stale && current.access_valid_at(unix_now()) {
                return Claim::Superseded;
            }
        }
        if state.exchange_in_flight {
            return Claim::Busy(self.generation.subscribe());
        }
        state.exchange_in_flight = true;
        if refreshing {
            state.status = AuthState::Refreshing;
        }
        Claim::Acquired(state.credential.clone())
    }

    /// Give up the exchange slot without a new credential
    async fn release(&self, status: AuthState) {
        {
            let mut state = self.state.lock().await;
            state.exchange_in_flight = false;
            state.status = status;
        }
        self.generation.send_modify(|g| *g += 1);
    }

    async fn install(&self, credential: Credential) {
        if let Err(e) = self.store.save(&credential) {
            // Keep running on the in-memory credential
            error!(error = %e, "Failed to persist refreshed credential");
        }
        {
            let mut state = self.state.lock().await;
            state.credential = Some(credential);
            state.status = AuthState::Valid;
            state.exchange_in_flight = false;
        }
        self.generation.send_modify(|g| *g += 1);
    }

    async fn wait_for_exchange(&self, mut rx: watch::Receiver<u64>) -> Result<(), AuthError> {
        debug!("Waiting for in-flight token exchange");
        let _ = rx.changed().await;
        match self.state().await {
            AuthState::Valid => Ok(()),
            _ => Err(AuthError::Unavailable),
        }
    }
}

#[async_trait]
impl AccessTokenSource for CredentialRefresher {
    async fn current_token(&self) -> Option<String> {
        CredentialRefresher::current_token(self).await
    }

    async fn force_refresh(&self, stale: &str) -> Result<String, AuthError> {
        CredentialRefresher::force_refresh(self, stale).await
    }

    async fn is_exhausted(&self) -> bool {
        CredentialRefresher::is_exhausted(self).await
    }
}
