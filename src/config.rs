//! Run configuration
//!
//! Loaded once from the environment (and `.env`), optionally overridden by CLI
//! flags, validated, then handed to each component by reference. Nothing here is
//! mutated after `validate()` succeeds.

use chrono::NaiveDate;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::{DateRange, FetchParams};

/// Sliding-window quota for outgoing requests
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 115,
            window: Duration::from_secs(25),
        }
    }
}

/// Retry ceiling and backoff shape for a single work unit
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay: Duration,
    pub transient_jitter: Duration,
    pub rate_limit_jitter_min: Duration,
    pub rate_limit_jitter_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(2),
            transient_jitter: Duration::from_secs(1),
            rate_limit_jitter_min: Duration::from_secs(1),
            rate_limit_jitter_max: Duration::from_secs(5),
        }
    }
}

/// Background credential renewal
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshConfig {
    pub poll_interval: Duration,
    pub safety_margin: Duration,
    pub refresh_lifetime: Duration,
    pub authorize_attempts: u32,
    pub authorize_retry_delay: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(25),
            safety_margin: Duration::from_secs(300),
            refresh_lifetime: Duration::from_secs(7 * 24 * 60 * 60),
            authorize_attempts: 3,
            authorize_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Batching and worker-pool bounds
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub max_workers: usize,
    pub max_pending: usize,
    pub batch_pause: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_workers: 25,
            max_pending: 55,
            batch_pause: Duration::from_secs(1),
        }
    }
}

/// Configuration for the application
#[derive(Debug, Clone)]
pub struct Config {
    pub schwab_api_key: String,
    pub schwab_app_secret: String,
    pub schwab_callback_url: String,
    pub schwab_token_path: PathBuf,
    pub api_base_url: String,
    pub progress_path: PathBuf,
    pub output_dir: PathBuf,
    pub symbols: Vec<String>,
    pub fetch: FetchParams,
    pub request_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub refresh: RefreshConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        let output_dir = PathBuf::from(env_or("OUTPUT_DIR", "data"));
        let progress_path = std::env::var("PROGRESS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| output_dir.join("progress.json"));

        let symbols = match std::env::var("SYMBOLS_FILE") {
            Ok(path) => read_symbols_file(Path::new(&path))?,
            Err(_) => parse_symbol_list(&env_or("SYMBOLS", "")),
        };

        let start_date = parse_date("START_DATE", &env_or("START_DATE", "2010-01-01"))?;
        let end_date = match std::env::var("END_DATE") {
            Ok(value) => parse_date("END_DATE", &value)?,
            Err(_) => chrono::Utc::now().date_naive(),
        };

        let retry_delay = Duration::from_secs(env_parse("RETRY_DELAY_SECS", 2)?);

        Ok(Config {
            schwab_api_key: std::env::var("SCHWAB_API_KEY")
                .map_err(|_| ConfigError::Missing("SCHWAB_API_KEY"))?,
            schwab_app_secret: std::env::var("SCHWAB_APP_SECRET")
                .map_err(|_| ConfigError::Missing("SCHWAB_APP_SECRET"))?,
            schwab_callback_url: env_or("SCHWAB_CALLBACK_URL", "https://127.0.0.1"),
            schwab_token_path: PathBuf::from(env_or("SCHWAB_TOKEN_PATH", "tokens.json")),
            api_base_url: env_or("SCHWAB_API_BASE_URL", "https://api.schwabapi.com"),
            progress_path,
            output_dir,
            symbols,
            fetch: FetchParams {
                date_range: DateRange::new(start_date, end_date),
                period_type: env_or("PERIOD_TYPE", "year"),
                period: env_parse("PERIOD", 10)?,
                frequency_type: env_or("FREQUENCY_TYPE", "daily"),
                frequency: env_parse("FREQUENCY", 1)?,
                extended_hours: env_parse("EXTENDED_HOURS", false)?,
                need_previous_close: env_parse("NEED_PREVIOUS_CLOSE", true)?,
            },
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 30)?),
            rate_limit: RateLimitConfig {
                max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS", 115)?,
                window: Duration::from_secs(env_parse("RATE_LIMIT_WINDOW_SECS", 25)?),
            },
            retry: RetryConfig {
                attempts: env_parse("RETRY_ATTEMPTS", 3)?,
                base_delay: retry_delay,
                ..RetryConfig::default()
            },
            refresh: RefreshConfig {
                poll_interval: Duration::from_secs(env_parse("TOKEN_POLL_SECS", 25)?),
                safety_margin: Duration::from_secs(env_parse("TOKEN_REFRESH_MARGIN_SECS", 300)?),
                authorize_retry_delay: retry_delay,
                ..RefreshConfig::default()
            },
            scheduler: SchedulerConfig {
                batch_size: env_parse("BATCH_SIZE", 50)?,
                max_workers: env_parse("MAX_WORKERS", 25)?,
                max_pending: env_parse("MAX_PENDING_TASKS", 55)?,
                batch_pause: Duration::from_secs(env_parse("BATCH_PAUSE_SECS", 1)?),
            },
        })
    }

    /// Check invariants and de-duplicate the symbol list (first occurrence wins)
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        self.symbols.retain(|s| seen.insert(s.clone()));

        if self.symbols.is_empty() {
            return Err(invalid("symbols", "at least one symbol is required"));
        }
        let range = self.fetch.date_range;
        if range.start_date > range.end_date {
            return Err(invalid(
                "date range",
                format!("start {} is after end {}", range.start_date, range.end_date),
            ));
        }
        if self.scheduler.max_workers == 0 {
            return Err(invalid("max_workers", "must be at least 1"));
        }
        if self.scheduler.max_pending < self.scheduler.max_workers {
            return Err(invalid(
                "max_pending",
                format!(
                    "{} is smaller than max_workers {}",
                    self.scheduler.max_pending, self.scheduler.max_workers
                ),
            ));
        }
        if self.scheduler.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(invalid("rate_limit.max_requests", "must be at least 1"));
        }
        if self.rate_limit.window.is_zero() {
            return Err(invalid("rate_limit.window", "must be non-zero"));
        }
        if self.retry.attempts == 0 {
            return Err(invalid("retry_attempts", "must be at least 1"));
        }
        Ok(self)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            field: key,
            reason: format!("{raw:?}: {e}"),
        }),
        Err(_) => Ok(default),
    }
}

/// Parse a `YYYY-MM-DD` date
pub fn parse_date(field: &'static str, value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("{value:?}: {e}. Expected YYYY-MM-DD"),
    })
}

/// Split a comma/whitespace separated symbol list, upper-casing each entry
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
        .collect()
}

/// One symbol per line; blank lines and `#` comments are skipped
pub fn read_symbols_file(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::SymbolsFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_uppercase)
        .collect())
}
