//! Batch scheduler
//!
//! Works through the symbols the progress ledger does not yet list as complete,
//! in fixed-size batches. Within a batch units run on spawned tasks: at most
//! `max_pending` are submitted and at most `max_workers` of those hold a worker
//! permit at a time. Submission stops when shutdown is requested or the
//! credential layer has nothing usable left; units already submitted still
//! resolve.

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::auth::AccessTokenSource;
use crate::config::SchedulerConfig;
use crate::error::{FailureKind, FetchError};
use crate::fetch_unit::FetchUnit;
use crate::models::{
    FailedUnit, FetchOutcome, FetchParams, RunSummary, StopReason, UnitReport, UnitStatus, UnitSuccess,
    WorkUnit,
};
use crate::output::ResultSink;
use crate::progress::ProgressLedger;
use crate::shutdown::SharedShutdown;

/// Completions between progress lines
const PROGRESS_LOG_EVERY: usize = 10;

/// Everything a spawned unit task needs
struct WorkerContext {
    fetcher: Arc<FetchUnit>,
    ledger: Arc<ProgressLedger>,
    credentials: Arc<dyn AccessTokenSource>,
    sink: Arc<dyn ResultSink>,
    shutdown: SharedShutdown,
    workers: Arc<Semaphore>,
}

impl WorkerContext {
    async fn stop_reason(&self) -> Option<StopReason> {
        if self.shutdown.is_shutdown_requested() {
            Some(StopReason::Interrupted)
        } else if self.credentials.is_exhausted().await {
            Some(StopReason::CredentialsExhausted)
        } else {
            None
        }
    }
}

/// Drives a whole run over a symbol list
pub struct BatchScheduler {
    ctx: Arc<WorkerContext>,
    config: SchedulerConfig,
}

impl BatchScheduler {
    pub fn new(
        fetcher: Arc<FetchUnit>,
        ledger: Arc<ProgressLedger>,
        credentials: Arc<dyn AccessTokenSource>,
        sink: Arc<dyn ResultSink>,
        shutdown: SharedShutdown,
        config: SchedulerConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            ctx: Arc::new(WorkerContext {
                fetcher,
                ledger,
                credentials,
                sink,
                shutdown,
                workers,
            }),
            config,
        }
    }

    /// Fetch every symbol not yet complete. Re-running resumes where the last run stopped.
    pub async fn run(&self, all_symbols: &[String], params: &FetchParams) -> RunSummary {
        let symbols = unique(all_symbols);
        let ledger = &self.ctx.ledger;
        if let Err(e) = ledger.begin_run(&params.run_key()).await {
            warn!(error = %e, "Failed to persist progress scope");
        }
        let remaining = ledger.remaining(&symbols).await;

        let mut summary = RunSummary {
            total_symbols: symbols.len(),
            previously_completed: ledger.completed_count(&symbols).await,
            ..Default::default()
        };

        info!(
            "🚀 Starting fetch: {} symbols, {} already complete, {} remaining",
            summary.total_symbols,
            summary.previously_completed,
            remaining.len()
        );
        info!(
            "📅 Date range: {} to {}",
            params.date_range.start_date, params.date_range.end_date
        );

        let batch_size = self.config.batch_size.max(1);
        let batch_count = remaining.len().div_ceil(batch_size);
        let mut resolved = 0;

        for (index, batch) in remaining.chunks(batch_size).enumerate() {
            if let Some(reason) = self.ctx.stop_reason().await {
                summary.stopped = Some(reason);
                break;
            }

            info!("📦 Batch {}/{}: {} symbols", index + 1, batch_count, batch.len());
            resolved += self.run_batch(batch, params, &mut summary).await;
            self.log_progress(&symbols).await;

            if let Some(reason) = self.ctx.stop_reason().await {
                summary.stopped = Some(reason);
                break;
            }

            if index + 1 < batch_count {
                debug!(pause_ms = self.config.batch_pause.as_millis() as u64, "Pausing between batches");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.batch_pause) => {}
                    _ = self.ctx.shutdown.wait_for_shutdown() => {}
                }
            }
        }

        summary.not_attempted += remaining.len() - resolved;
        summary.completed_total = ledger.completed_count(&symbols).await;

        match summary.stopped {
            Some(StopReason::Interrupted) => warn!("⚠️ Run interrupted, progress saved"),
            Some(StopReason::CredentialsExhausted) => {
                error!("❌ No usable access token, stopped submitting work")
            }
            None => info!("✅ Run finished"),
        }
        summary
    }

    /// Run one batch to completion and fold its reports into `summary`.
    /// Returns how many units were submitted.
    async fn run_batch(&self, batch: &[String], params: &FetchParams, summary: &mut RunSummary) -> usize {
        let gate = self.ctx.clone();
        let ctx = self.ctx.clone();
        let params = params.clone();

        let reports = stream::iter(batch.iter().cloned())
            .take_while(move |_| {
                let gate = gate.clone();
                async move { gate.stop_reason().await.is_none() }
            })
            .map(move |symbol| {
                let ctx = ctx.clone();
                let unit = WorkUnit::new(symbol.clone(), params.clone());
                async move {
                    match tokio::spawn(process_unit(ctx, unit)).await {
                        Ok(report) => report,
                        Err(e) => {
                            error!(symbol = %symbol, error = %e, "Unit task panicked");
                            UnitReport::failed(symbol, FailureKind::Internal, 0, e)
                        }
                    }
                }
            })
            .buffer_unordered(self.config.max_pending.max(1));
        let mut reports = pin!(reports);

        let mut submitted = 0;
        while let Some(report) = reports.next().await {
            submitted += 1;
            let completed_before = summary.completed_this_run + summary.no_data;
            tally(summary, report);
            let completed_now = summary.completed_this_run + summary.no_data;
            if completed_now != completed_before && completed_now % PROGRESS_LOG_EVERY == 0 {
                log_run_progress(summary);
            }
        }
        submitted
    }

    async fn log_progress(&self, symbols: &[String]) {
        let done = self.ctx.ledger.completed_count(symbols).await;
        let pct = self.ctx.ledger.completion_fraction(symbols).await * 100.0;
        info!("📊 Progress: {}/{} ({:.1}%)", done, symbols.len(), pct);
    }
}

async fn process_unit(ctx: Arc<WorkerContext>, unit: WorkUnit) -> UnitReport {
    let symbol = unit.symbol.clone();

    let _permit = match ctx.workers.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => return UnitReport::failed(symbol, FailureKind::Internal, 0, e),
    };

    if ctx.shutdown.is_shutdown_requested() {
        return UnitReport::failed(symbol, FailureKind::Cancelled, 0, "shutdown requested");
    }

    let Some(token) = ctx.credentials.current_token().await else {
        return UnitReport::failed(symbol, FailureKind::Auth, 0, FetchError::NoCredential);
    };

    debug!(symbol = %symbol, "Starting unit");
    let UnitSuccess { outcome, attempts } = match ctx.fetcher.fetch(&unit, token).await {
        Ok(success) => success,
        Err(failure) => {
            error!(
                symbol = %symbol,
                kind = %failure.kind,
                attempts = failure.attempts,
                "❌ Failed {}: {}",
                symbol,
                failure.source
            );
            return UnitReport::failed(symbol, failure.kind, failure.attempts, &failure.source);
        }
    };

    let (status, span) = match outcome {
        FetchOutcome::Fetched(history) => {
            let records = history.records.len();
            let span = history.span();
            if let Err(e) = ctx.sink.persist(&history, &unit.params) {
                error!(symbol = %symbol, attempts, error = %e, "❌ Failed to save data");
                return UnitReport::failed(symbol, FailureKind::Persistence, attempts, e);
            }
            (UnitStatus::Completed { records }, span)
        }
        FetchOutcome::NoData => {
            info!(symbol = %symbol, "No data returned for range");
            (UnitStatus::NoData, None)
        }
    };

    if let Err(e) = ctx.ledger.mark_complete(&symbol).await {
        // Still complete in memory for this run; next run may repeat the unit
        warn!(symbol = %symbol, error = %e, "Failed to persist progress");
    }

    if let UnitStatus::Completed { records } = status {
        match span {
            Some((first, last)) => info!(
                "✅ Completed {} ({} records, {} to {})",
                symbol,
                records,
                first.format("%Y-%m-%d %H:%M"),
                last.format("%Y-%m-%d %H:%M")
            ),
            None => info!("✅ Completed {} ({} records)", symbol, records),
        }
    }
    UnitReport { symbol, status }
}

fn log_run_progress(summary: &RunSummary) {
    let done = summary.previously_completed + summary.completed_this_run + summary.no_data;
    let pct = if summary.total_symbols == 0 {
        100.0
    } else {
        done as f64 / summary.total_symbols as f64 * 100.0
    };
    info!("📈 Progress: {}/{} ({:.1}%)", done, summary.total_symbols, pct);
}

fn tally(summary: &mut RunSummary, report: UnitReport) {
    match report.status {
        UnitStatus::Completed { records } => {
            summary.completed_this_run += 1;
            summary.records_fetched += records;
        }
        UnitStatus::NoData => summary.no_data += 1,
        UnitStatus::Failed {
            kind: FailureKind::Cancelled,
            ..
        } => summary.not_attempted += 1,
        UnitStatus::Failed {
            kind,
            attempts,
            error,
        } => summary.failed.push(FailedUnit {
            symbol: report.symbol,
            kind,
            attempts,
            error,
        }),
    }
}

fn unique(symbols: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    symbols
        .iter()
        .filter(|s| seen.insert(s.as_str()))
        .cloned()
        .collect()
}
