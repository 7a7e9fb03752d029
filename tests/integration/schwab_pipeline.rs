//! Full pipeline over HTTP: Schwab client, retries, credential refresh, CSV output

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::logging::{init_test_logging, log_test_step};
use crate::common::test_data::{fast_retry, fetch_params, symbols};
use crate::common::StaticTokens;
use price_history_fetcher::{
    api::{RateLimiter, SchwabClient},
    auth::{
        unix_now, AccessTokenSource, AuthorizationCodeProvider, Credential, CredentialRefresher,
        CredentialStore, SchwabOAuth,
    },
    config::{RateLimitConfig, RefreshConfig, SchedulerConfig},
    error::{AuthError, FailureKind},
    output::{file_name, CsvSink},
    retry::Backoff,
    shutdown::ShutdownCoordinator,
    BatchScheduler, FetchUnit, ProgressLedger,
};

const PRICE_HISTORY: &str = "/marketdata/v1/pricehistory";

fn wire(
    dir: &Path,
    server: &MockServer,
    tokens: Arc<dyn AccessTokenSource>,
) -> (BatchScheduler, Arc<ProgressLedger>) {
    let client = SchwabClient::with_base_url(&server.uri(), Duration::from_secs(5)).unwrap();
    let fetcher = FetchUnit::new(
        Arc::new(client),
        Arc::new(RateLimiter::new(&RateLimitConfig::default())),
        tokens.clone(),
        Backoff::new(fast_retry(3)),
    );
    let ledger = Arc::new(ProgressLedger::open(dir.join("progress.json")));
    let scheduler = BatchScheduler::new(
        Arc::new(fetcher),
        ledger.clone(),
        tokens,
        Arc::new(CsvSink::new(dir.join("data"))),
        ShutdownCoordinator::shared(),
        SchedulerConfig {
            batch_size: 10,
            max_workers: 4,
            max_pending: 8,
            batch_pause: Duration::from_millis(10),
        },
    );
    (scheduler, ledger)
}

fn two_candles() -> serde_json::Value {
    json!({
        "symbol": "AAA",
        "empty": false,
        "candles": [
            {"datetime": 1_704_240_000_000i64, "open": "101.5", "high": 103.0, "low": 100.0, "close": 102.0, "volume": 2000},
            {"datetime": 1_704_153_600_000i64, "open": 100.0, "high": 102.0, "low": 99.0, "close": 101.0, "volume": "n/a"}
        ]
    })
}

#[tokio::test]
async fn test_pipeline_writes_csv_and_classifies_outcomes() {
    init_test_logging();
    log_test_step("AAA has data, BBB is empty, ZZZ is rejected");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(PRICE_HISTORY))
        .and(query_param("symbol", "AAA"))
        .and(header("Authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(two_candles()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(PRICE_HISTORY))
        .and(query_param("symbol", "BBB"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"empty": true, "candles": []})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(PRICE_HISTORY))
        .and(query_param("symbol", "ZZZ"))
        .respond_with(ResponseTemplate::new(400).set_body_string("{\"errors\":[\"bad symbol\"]}"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (scheduler, ledger) = wire(dir.path(), &server, Arc::new(StaticTokens));
    let summary = scheduler.run(&symbols(&["AAA", "BBB", "ZZZ"]), &fetch_params()).await;

    assert_eq!(summary.completed_this_run, 1);
    assert_eq!(summary.no_data, 1);
    assert_eq!(summary.records_fetched, 2);
    assert_eq!(summary.failed_count(), 1);
    assert_eq!(summary.failed[0].kind, FailureKind::NonRetryable);
    assert_eq!(ledger.completed().await, symbols(&["AAA", "BBB"]));

    let csv = std::fs::read_to_string(dir.path().join("data").join(file_name("AAA", &fetch_params()))).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "symbol,datetime,open,high,low,close,volume");
    // Sorted by time; unparseable volume becomes an empty cell
    assert_eq!(lines[1], "AAA,2024-01-02T00:00:00+00:00,100.0,102.0,99.0,101.0,");
    assert_eq!(lines[2], "AAA,2024-01-03T00:00:00+00:00,101.5,103.0,100.0,102.0,2000.0");
}

#[tokio::test]
async fn test_remote_rate_limit_is_retried() {
    init_test_logging();
    log_test_step("First request answered with 429");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(PRICE_HISTORY))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(PRICE_HISTORY))
        .respond_with(ResponseTemplate::new(200).set_body_json(two_candles()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (scheduler, ledger) = wire(dir.path(), &server, Arc::new(StaticTokens));
    let summary = scheduler.run(&symbols(&["AAA"]), &fetch_params()).await;

    assert_eq!(summary.completed_this_run, 1);
    assert!(ledger.is_complete("AAA").await);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

struct NoHuman;

#[async_trait::async_trait]
impl AuthorizationCodeProvider for NoHuman {
    async fn obtain_code(&self, _authorize_url: &str) -> Result<String, AuthError> {
        Err(AuthError::CodeUnavailable("no console in tests".into()))
    }
}

#[tokio::test]
async fn test_revoked_token_is_refreshed_mid_run() {
    init_test_logging();
    log_test_step("Stored token rejected by the API, refresh succeeds");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(PRICE_HISTORY))
        .and(header("Authorization", "Bearer revoked"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(PRICE_HISTORY))
        .and(header("Authorization", "Bearer renewed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(two_candles()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(body_string_contains("refresh_token=still-good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "renewed",
            "refresh_token": "rotated",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(dir.path().join("tokens.json"));
    let now = unix_now();
    store
        .save(&Credential {
            access_token: "revoked".into(),
            refresh_token: "still-good".into(),
            access_token_expiry: now + 3600,
            refresh_token_expiry: now + 86_400,
        })
        .unwrap();

    let oauth = SchwabOAuth::with_base_url(&server.uri(), "key", "secret", "https://127.0.0.1").unwrap();
    let refresher = Arc::new(CredentialRefresher::new(
        store.clone(),
        Arc::new(oauth),
        Arc::new(NoHuman),
        RefreshConfig::default(),
    ));
    refresher.initialize().await.unwrap();

    let (scheduler, ledger) = wire(dir.path(), &server, refresher.clone());
    let summary = scheduler.run(&symbols(&["AAA", "BBB"]), &fetch_params()).await;

    assert_eq!(summary.failed_count(), 0, "{:?}", summary.failed);
    assert_eq!(ledger.completed().await, symbols(&["AAA", "BBB"]));
    assert_eq!(refresher.current_token().await.as_deref(), Some("renewed"));
    assert_eq!(store.load().unwrap().refresh_token, "rotated");
}
