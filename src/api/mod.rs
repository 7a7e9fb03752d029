use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::FetchError;
use crate::models::WorkUnit;

pub mod parser;
pub mod rate_limiter;
pub mod schwab_client;

pub use rate_limiter::RateLimiter;
pub use schwab_client::SchwabClient;

/// Price history body as returned by the remote API, before coercion
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawPriceHistory {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub empty: bool,
    #[serde(default)]
    pub candles: Vec<Value>,
}

impl RawPriceHistory {
    /// The remote flags "no data" either explicitly or with an empty candle list
    pub fn is_empty(&self) -> bool {
        self.empty || self.candles.is_empty()
    }
}

/// Source of price history for one work unit.
///
/// Implementations make exactly one network attempt per call and classify the
/// result; retrying is the caller's business.
#[async_trait]
pub trait PriceHistoryProvider: Send + Sync {
    async fn price_history(
        &self,
        unit: &WorkUnit,
        access_token: &str,
    ) -> Result<RawPriceHistory, FetchError>;
}
