use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION},
    Client, StatusCode,
};
use std::time::Duration;
use tracing::{debug, warn};

use super::{PriceHistoryProvider, RawPriceHistory};
use crate::config::Config;
use crate::error::FetchError;
use crate::models::WorkUnit;

const PRICE_HISTORY_PATH: &str = "/marketdata/v1/pricehistory";

/// Schwab market-data client
pub struct SchwabClient {
    client: Client,
    base_url: String,
}

impl SchwabClient {
    /// Create a new Schwab client
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::with_base_url(&config.api_base_url, config.request_timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("price-history-fetcher/1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn headers(access_token: &str) -> Result<HeaderMap, FetchError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .map_err(|_| FetchError::Auth { status: 0 })?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(correl_id) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            headers.insert("Schwab-Client-CorrelId", correl_id);
        }
        headers.insert("Schwab-Resource-Version", HeaderValue::from_static("1.0"));
        Ok(headers)
    }

    fn query(unit: &WorkUnit) -> Vec<(&'static str, String)> {
        let params = &unit.params;
        vec![
            ("symbol", unit.symbol.clone()),
            ("startDate", params.date_range.start_millis().to_string()),
            ("endDate", params.date_range.end_millis().to_string()),
            ("periodType", params.period_type.clone()),
            ("period", params.period.to_string()),
            ("frequencyType", params.frequency_type.clone()),
            ("frequency", params.frequency.to_string()),
            ("needExtendedHoursData", params.extended_hours.to_string()),
            ("needPreviousClose", params.need_previous_close.to_string()),
        ]
    }
}

/// Map a non-success status onto the retry taxonomy
fn classify_status(status: StatusCode, body: String) -> FetchError {
    match status.as_u16() {
        429 => FetchError::RateLimited,
        401 | 403 => FetchError::Auth {
            status: status.as_u16(),
        },
        502 | 503 | 504 => FetchError::Transient(format!("server returned {status}")),
        code => FetchError::Http { status: code, body },
    }
}

fn classify_transport(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transient(error.to_string())
    }
}

#[async_trait]
impl PriceHistoryProvider for SchwabClient {
    async fn price_history(
        &self,
        unit: &WorkUnit,
        access_token: &str,
    ) -> Result<RawPriceHistory, FetchError> {
        let url = format!("{}{}", self.base_url, PRICE_HISTORY_PATH);
        debug!(symbol = %unit.symbol, "Requesting price history");

        let response = self
            .client
            .get(&url)
            .headers(Self::headers(access_token)?)
            .query(&Self::query(unit))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(symbol = %unit.symbol, %status, "Price history request failed");
            return Err(classify_status(status, body));
        }

        let bytes = response.bytes().await.map_err(classify_transport)?;
        let raw: RawPriceHistory =
            serde_json::from_slice(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

        debug!(
            symbol = %unit.symbol,
            candles = raw.candles.len(),
            empty = raw.empty,
            "Price history response received"
        );
        Ok(raw)
    }
}
