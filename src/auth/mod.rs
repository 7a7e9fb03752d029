//! OAuth credential lifecycle: persistence, token endpoint, background renewal

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AuthError;

pub mod oauth;
pub mod refresher;
pub mod store;

pub use oauth::{ConsoleCodeProvider, SchwabOAuth};
pub use refresher::CredentialRefresher;
pub use store::CredentialStore;

/// Access/refresh token pair with epoch-second expiries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expiry: i64,
    pub refresh_token_expiry: i64,
}

impl Credential {
    /// Build a credential from a fresh grant.
    ///
    /// When the grant carries no new refresh token the previous one and its
    /// expiry are kept.
    pub fn from_grant(
        grant: TokenGrant,
        previous: Option<&Credential>,
        refresh_lifetime: Duration,
        now: i64,
    ) -> Result<Self, AuthError> {
        let (refresh_token, refresh_token_expiry) = match (grant.refresh_token, previous) {
            (Some(token), _) => (token, now.saturating_add(secs(refresh_lifetime))),
            (None, Some(prev)) => (prev.refresh_token.clone(), prev.refresh_token_expiry),
            (None, None) => {
                return Err(AuthError::Malformed(
                    "grant carried no refresh token".to_string(),
                ))
            }
        };

        Ok(Self {
            access_token: grant.access_token,
            refresh_token,
            access_token_expiry: now.saturating_add(grant.expires_in.max(0)),
            refresh_token_expiry,
        })
    }

    pub fn access_valid_at(&self, now: i64) -> bool {
        !self.access_token.is_empty() && now < self.access_token_expiry
    }

    pub fn refresh_valid_at(&self, now: i64) -> bool {
        !self.refresh_token.is_empty() && now < self.refresh_token_expiry
    }

    /// Access token is expired or within `margin` of expiring
    pub fn needs_renewal_at(&self, now: i64, margin: Duration) -> bool {
        now >= self.access_token_expiry.saturating_sub(secs(margin))
    }
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

/// Credential lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Valid,
    Refreshing,
    ExpiredNeedsReauth,
}

/// Token endpoint response, normalised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// Remote OAuth token endpoint
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Where the user goes to approve access
    fn authorize_url(&self) -> String;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;
}

/// Human-in-the-loop step of the authorization-code flow
#[async_trait]
pub trait AuthorizationCodeProvider: Send + Sync {
    async fn obtain_code(&self, authorize_url: &str) -> Result<String, AuthError>;
}

/// What the fetch path needs from the credential layer
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// Latest known access token, if any
    async fn current_token(&self) -> Option<String>;

    /// A token other than `stale`, exchanging at most once across callers
    async fn force_refresh(&self, stale: &str) -> Result<String, AuthError>;

    /// Nothing usable now and nothing in flight that could fix it
    async fn is_exhausted(&self) -> bool;
}

/// Current wall-clock time in epoch seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
