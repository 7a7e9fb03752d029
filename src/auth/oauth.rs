use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client,
};
use serde::Deserialize;
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use super::{AuthorizationCodeProvider, TokenEndpoint, TokenGrant};
use crate::config::Config;
use crate::error::AuthError;

/// Schwab OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Client for the Schwab OAuth endpoints
pub struct SchwabOAuth {
    client: Client,
    base_url: String,
    api_key: String,
    app_secret: String,
    callback_url: String,
}

impl SchwabOAuth {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::with_base_url(
            &config.api_base_url,
            &config.schwab_api_key,
            &config.schwab_app_secret,
            &config.schwab_callback_url,
        )
    }

    pub fn with_base_url(
        base_url: &str,
        api_key: &str,
        app_secret: &str,
        callback_url: &str,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("price-history-fetcher/1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            app_secret: app_secret.to_string(),
            callback_url: callback_url.to_string(),
        })
    }

    fn headers(&self) -> Result<HeaderMap, AuthError> {
        let auth_header =
            general_purpose::STANDARD.encode(format!("{}:{}", self.api_key, self.app_secret));

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {auth_header}"))
                .map_err(|e| AuthError::Transport(e.to_string()))?,
        );
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        Ok(headers)
    }

    async fn post_token(&self, params: &[(&str, &str)]) -> Result<TokenGrant, AuthError> {
        let url = format!("{}/v1/oauth/token", self.base_url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 | 401 | 403 => AuthError::Rejected {
                    status: status.as_u16(),
                    body,
                },
                _ => AuthError::Transport(format!("token endpoint returned {status}: {body}")),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))?;

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
        })
    }
}

#[async_trait]
impl TokenEndpoint for SchwabOAuth {
    fn authorize_url(&self) -> String {
        let base = format!("{}/v1/oauth/authorize", self.base_url);
        match Url::parse_with_params(
            &base,
            &[
                ("client_id", self.api_key.as_str()),
                ("redirect_uri", self.callback_url.as_str()),
            ],
        ) {
            Ok(url) => url.to_string(),
            Err(_) => format!(
                "{base}?client_id={}&redirect_uri={}",
                self.api_key, self.callback_url
            ),
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError> {
        debug!("Exchanging authorization code");
        self.post_token(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.callback_url.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        debug!("Refreshing access token");
        self.post_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}

/// Pull the `code` parameter out of the URL the browser was redirected to
pub fn extract_code(redirected: &str) -> Result<String, AuthError> {
    let url = Url::parse(redirected.trim())
        .map_err(|e| AuthError::CodeUnavailable(format!("not a URL: {e}")))?;
    url.query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AuthError::CodeUnavailable("redirect URL has no code parameter".into()))
}

/// Prints the authorization URL and reads the redirect URL from stdin
#[derive(Debug, Default)]
pub struct ConsoleCodeProvider;

#[async_trait]
impl AuthorizationCodeProvider for ConsoleCodeProvider {
    async fn obtain_code(&self, authorize_url: &str) -> Result<String, AuthError> {
        let url = authorize_url.to_string();
        // Plain thread, not spawn_blocking: an unanswered prompt must not hold
        // up runtime shutdown
        let (tx, rx) = oneshot::channel();
        std::thread::spawn(move || {
            let _ = tx.send(prompt_for_redirect(&url));
        });
        let line = rx
            .await
            .map_err(|e| AuthError::CodeUnavailable(e.to_string()))?
            .map_err(|e| AuthError::CodeUnavailable(e.to_string()))?;

        match extract_code(&line) {
            Ok(code) => {
                info!("Authorization code received");
                Ok(code)
            }
            Err(e) => {
                warn!(error = %e, "Could not read authorization code");
                Err(e)
            }
        }
    }
}

fn prompt_for_redirect(url: &str) -> io::Result<String> {
    println!("🔐 Open this URL to authorize access:\n{url}");
    print!("Paste the URL you were redirected to: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}
