use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::parser::parse_price_history;
use crate::api::{PriceHistoryProvider, RateLimiter};
use crate::auth::AccessTokenSource;
use crate::error::{FetchError, UnitFailure};
use crate::models::{UnitSuccess, WorkUnit};
use crate::retry::Backoff;

/// Fetches one work unit with admission control and typed retries
pub struct FetchUnit {
    provider: Arc<dyn PriceHistoryProvider>,
    limiter: Arc<RateLimiter>,
    credentials: Arc<dyn AccessTokenSource>,
    backoff: Backoff,
}

impl FetchUnit {
    pub fn new(
        provider: Arc<dyn PriceHistoryProvider>,
        limiter: Arc<RateLimiter>,
        credentials: Arc<dyn AccessTokenSource>,
        backoff: Backoff,
    ) -> Self {
        Self {
            provider,
            limiter,
            credentials,
            backoff,
        }
    }

    /// Fetch and parse `unit`, retrying per error class.
    ///
    /// Every attempt passes through the rate limiter and counts against the
    /// attempt ceiling, whatever the previous failure was.
    pub async fn fetch(&self, unit: &WorkUnit, token: String) -> Result<UnitSuccess, UnitFailure> {
        let symbol = unit.symbol.as_str();
        let max_attempts = self.backoff.attempts().max(1);
        let mut token = token;
        let mut refreshed = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.limiter.admit().await;

            let error = match self.provider.price_history(unit, &token).await {
                Ok(raw) => {
                    debug!(symbol, attempt, candles = raw.candles.len(), "Received price history");
                    return Ok(UnitSuccess {
                        outcome: parse_price_history(symbol, &raw),
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                warn!(symbol, attempt, error = %error, "Giving up after max attempts");
                return Err(UnitFailure::new(error, attempt));
            }

            match &error {
                FetchError::Http { .. } | FetchError::NoCredential => {
                    warn!(symbol, attempt, error = %error, "Non-retryable error");
                    return Err(UnitFailure::new(error, attempt));
                }
                FetchError::Auth { status } => {
                    if refreshed {
                        warn!(symbol, attempt, status, "Still unauthorized after forced refresh");
                        return Err(UnitFailure::new(error, attempt));
                    }
                    refreshed = true;
                    warn!(symbol, attempt, status, "Unauthorized, forcing token refresh");
                    match self.credentials.force_refresh(&token).await {
                        Ok(fresh) => token = fresh,
                        Err(e) => {
                            warn!(symbol, error = %e, "Forced refresh failed");
                            return Err(UnitFailure::new(error, attempt));
                        }
                    }
                }
                FetchError::RateLimited => {
                    let delay = self.backoff.rate_limited_delay(attempt);
                    warn!(
                        symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limit hit (429), backing off"
                    );
                    tokio::time::sleep(delay).await;
                    if let Some(current) = self.credentials.current_token().await {
                        token = current;
                    }
                }
                FetchError::Timeout | FetchError::Transient(_) | FetchError::Parse(_) => {
                    let delay = self.backoff.transient_delay(attempt);
                    warn!(
                        symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
