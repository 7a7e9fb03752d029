pub mod api;
pub mod auth;
pub mod concurrent_fetcher;
pub mod config;
pub mod error;
pub mod fetch_unit;
pub mod models;
pub mod output;
pub mod progress;
pub mod retry;
pub mod shutdown;

mod persistence;

pub use concurrent_fetcher::BatchScheduler;
pub use config::Config;
pub use fetch_unit::FetchUnit;
pub use progress::ProgressLedger;
