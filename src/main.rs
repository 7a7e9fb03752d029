use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use price_history_fetcher::{
    api::{RateLimiter, SchwabClient},
    auth::{ConsoleCodeProvider, CredentialRefresher, CredentialStore, SchwabOAuth},
    config::{parse_date, parse_symbol_list, read_symbols_file},
    models::RunSummary,
    output::CsvSink,
    retry::Backoff,
    shutdown::{install_ctrl_c_handler, ShutdownCoordinator},
    BatchScheduler, Config, FetchUnit, ProgressLedger,
};

/// Fetch Schwab price history for a list of symbols, resuming from saved progress
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Comma-separated symbols (overrides SYMBOLS)
    #[arg(long)]
    symbols: Option<String>,

    /// File with one symbol per line (overrides SYMBOLS_FILE)
    #[arg(long)]
    symbols_file: Option<PathBuf>,

    /// Start date in YYYY-MM-DD format
    #[arg(short, long)]
    start_date: Option<String>,

    /// End date in YYYY-MM-DD format
    #[arg(short, long)]
    end_date: Option<String>,

    /// Units fetching at the same time
    #[arg(short, long)]
    workers: Option<usize>,

    /// Units submitted but not yet finished
    #[arg(long)]
    max_pending: Option<usize>,

    /// Symbols per batch
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Attempts per symbol
    #[arg(short, long)]
    retries: Option<u32>,

    /// Directory for CSV output and the progress file
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Forget saved progress and fetch every symbol again
    #[arg(long)]
    reset_progress: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, mut config: Config) -> Result<Config> {
        if let Some(path) = &self.symbols_file {
            config.symbols = read_symbols_file(path)?;
        }
        if let Some(list) = &self.symbols {
            config.symbols = parse_symbol_list(list);
        }
        if let Some(start) = &self.start_date {
            config.fetch.date_range.start_date = parse_date("--start-date", start)?;
        }
        if let Some(end) = &self.end_date {
            config.fetch.date_range.end_date = parse_date("--end-date", end)?;
        }
        if let Some(workers) = self.workers {
            config.scheduler.max_workers = workers;
        }
        if let Some(max_pending) = self.max_pending {
            config.scheduler.max_pending = max_pending;
        }
        if let Some(batch_size) = self.batch_size {
            config.scheduler.batch_size = batch_size;
        }
        if let Some(retries) = self.retries {
            config.retry.attempts = retries;
        }
        if let Some(dir) = &self.output_dir {
            if std::env::var("PROGRESS_PATH").is_err() {
                config.progress_path = dir.join("progress.json");
            }
            config.output_dir = dir.clone();
        }
        Ok(config.validate()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "price_history_fetcher=debug"
    } else {
        "price_history_fetcher=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    info!("🚀 Schwab Price History Fetcher");
    info!("==============================");

    let config = match Config::from_env()
        .map_err(anyhow::Error::from)
        .and_then(|config| args.apply(config))
    {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e:#}");
            eprintln!("❌ Configuration Error: {e:#}");
            eprintln!("Make sure you have a .env file with the required Schwab API credentials.");
            std::process::exit(1);
        }
    };

    info!("📊 Symbols: {}", config.symbols.len());
    info!(
        "🧵 Workers: {}, pending: {}, batch: {}",
        config.scheduler.max_workers, config.scheduler.max_pending, config.scheduler.batch_size
    );
    info!(
        "⏱️ Rate limit: {} requests / {}s",
        config.rate_limit.max_requests,
        config.rate_limit.window.as_secs()
    );

    let shutdown = ShutdownCoordinator::shared();
    install_ctrl_c_handler(shutdown.clone());

    let ledger = Arc::new(ProgressLedger::open(&config.progress_path));
    if args.reset_progress {
        ledger.reset().await.context("failed to reset progress")?;
    }

    let refresher = Arc::new(CredentialRefresher::new(
        CredentialStore::new(&config.schwab_token_path),
        Arc::new(SchwabOAuth::new(&config)?),
        Arc::new(ConsoleCodeProvider),
        config.refresh.clone(),
    ));
    refresher
        .initialize()
        .await
        .context("could not obtain an access token")?;
    let refresh_task = refresher.clone().spawn(shutdown.clone());

    let fetcher = FetchUnit::new(
        Arc::new(SchwabClient::new(&config)?),
        Arc::new(RateLimiter::new(&config.rate_limit)),
        refresher.clone(),
        Backoff::new(config.retry.clone()),
    );
    let scheduler = BatchScheduler::new(
        Arc::new(fetcher),
        ledger,
        refresher,
        Arc::new(CsvSink::new(&config.output_dir)),
        shutdown.clone(),
        config.scheduler.clone(),
    );

    let summary = scheduler.run(&config.symbols, &config.fetch).await;

    shutdown.request_shutdown();
    if let Err(e) = refresh_task.await {
        warn!("Token refresh task ended abnormally: {}", e);
    }

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    info!("✅ Fetch Results:");
    info!("   - Total symbols: {}", summary.total_symbols);
    info!("   - Previously completed: {}", summary.previously_completed);
    info!("   - Completed this run: {}", summary.completed_this_run);
    info!("   - No data: {}", summary.no_data);
    info!("   - Failed: {}", summary.failed_count());
    info!("   - Not attempted: {}", summary.not_attempted);
    info!("   - Records fetched: {}", summary.records_fetched);
    info!(
        "📈 Completion: {}/{} ({:.1}%), {} remaining",
        summary.completed_total,
        summary.total_symbols,
        summary.completion_percentage(),
        summary.remaining()
    );

    for failed in &summary.failed {
        warn!(
            "   ❌ {} [{}] after {} attempt(s): {}",
            failed.symbol, failed.kind, failed.attempts, failed.error
        );
    }
    if summary.failed.iter().any(|f| f.kind.is_transient()) {
        info!("💡 Some failures look transient; re-run to retry them");
    }
}
