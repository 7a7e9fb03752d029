//! Credential refresher against a mocked Schwab token endpoint

use assert_matches::assert_matches;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::logging::{init_test_logging, log_test_step};
use price_history_fetcher::{
    auth::{
        unix_now, AuthState, AuthorizationCodeProvider, Credential, CredentialRefresher,
        CredentialStore, SchwabOAuth,
    },
    config::RefreshConfig,
    error::AuthError,
};

struct PastedCode {
    prompts: AtomicUsize,
}

#[async_trait]
impl AuthorizationCodeProvider for PastedCode {
    async fn obtain_code(&self, authorize_url: &str) -> Result<String, AuthError> {
        assert!(authorize_url.contains("/v1/oauth/authorize?client_id=key"));
        self.prompts.fetch_add(1, Ordering::SeqCst);
        Ok("pasted-code".to_string())
    }
}

fn save_credential(store: &CredentialStore, access_in: i64, refresh_in: i64) {
    let now = unix_now();
    store
        .save(&Credential {
            access_token: "old-access".into(),
            refresh_token: "old-refresh".into(),
            access_token_expiry: now + access_in,
            refresh_token_expiry: now + refresh_in,
        })
        .unwrap();
}

fn refresher(server: &MockServer, store: CredentialStore, code: Arc<PastedCode>) -> CredentialRefresher {
    let oauth = SchwabOAuth::with_base_url(&server.uri(), "key", "secret", "https://127.0.0.1").unwrap();
    CredentialRefresher::new(store, Arc::new(oauth), code, RefreshConfig::default())
}

fn pasted_code() -> Arc<PastedCode> {
    Arc::new(PastedCode {
        prompts: AtomicUsize::new(0),
    })
}

#[tokio::test]
async fn test_stale_access_token_is_refreshed_and_persisted() {
    init_test_logging();
    log_test_step("Access token inside the refresh margin at start-up");

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(body_string_contains("refresh_token=old-refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(dir.path().join("tokens.json"));
    save_credential(&store, 60, 86_400);
    let code = pasted_code();
    let refresher = refresher(&server, store.clone(), code.clone());

    refresher.initialize().await.unwrap();

    assert_eq!(refresher.state().await, AuthState::Valid);
    assert_eq!(refresher.current_token().await.as_deref(), Some("new-access"));
    assert_eq!(code.prompts.load(Ordering::SeqCst), 0);

    let saved = store.load().unwrap();
    assert_eq!(saved.access_token, "new-access");
    // No new refresh token in the grant: the old one and its expiry are kept
    assert_eq!(saved.refresh_token, "old-refresh");
    assert!(saved.access_token_expiry > unix_now() + 1700);
}

#[tokio::test]
async fn test_rejected_refresh_token_triggers_reauthorization() {
    init_test_logging();
    log_test_step("Refresh token rejected, falling back to the code flow");

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("{\"error\":\"invalid_grant\"}"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=pasted-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "authorized-access",
            "refresh_token": "authorized-refresh",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(dir.path().join("tokens.json"));
    save_credential(&store, 0, 86_400);
    let code = pasted_code();
    let refresher = refresher(&server, store.clone(), code.clone());

    refresher.initialize().await.unwrap();

    assert_eq!(code.prompts.load(Ordering::SeqCst), 1);
    let saved = store.load().unwrap();
    assert_eq!(saved.access_token, "authorized-access");
    assert_eq!(saved.refresh_token, "authorized-refresh");
    // Fresh refresh token gets the full seven-day lifetime
    let lifetime = saved.refresh_token_expiry - unix_now();
    assert!((7 * 86_400 - 5..=7 * 86_400).contains(&lifetime));
}

#[tokio::test]
async fn test_force_refresh_returns_new_token_once() {
    init_test_logging();
    log_test_step("Concurrent forced refreshes share one exchange");

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "forced", "expires_in": 1800}))
                .set_delay(std::time::Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(dir.path().join("tokens.json"));
    save_credential(&store, 3600, 86_400);
    let refresher = Arc::new(refresher(&server, store, pasted_code()));
    refresher.initialize().await.unwrap();

    let (a, b, c) = tokio::join!(
        refresher.force_refresh("old-access"),
        refresher.force_refresh("old-access"),
        refresher.force_refresh("old-access"),
    );
    assert_eq!(a.unwrap(), "forced");
    assert_eq!(b.unwrap(), "forced");
    assert_eq!(c.unwrap(), "forced");
}

#[tokio::test]
async fn test_unreachable_endpoint_without_credential_fails() {
    init_test_logging();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(dir.path().join("tokens.json"));
    let code = pasted_code();
    let config = RefreshConfig {
        authorize_retry_delay: std::time::Duration::from_millis(5),
        ..RefreshConfig::default()
    };
    let oauth = SchwabOAuth::with_base_url(&server.uri(), "key", "secret", "https://127.0.0.1").unwrap();
    let refresher = CredentialRefresher::new(store.clone(), Arc::new(oauth), code.clone(), config);

    assert_matches!(refresher.initialize().await, Err(AuthError::Transport(_)));
    assert_eq!(code.prompts.load(Ordering::SeqCst), 3);
    assert_eq!(refresher.state().await, AuthState::Unauthenticated);
    assert!(refresher.is_exhausted().await);
    assert!(store.load().is_none());
}
