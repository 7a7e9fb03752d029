use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// Date range for fetching data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl DateRange {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self { start_date, end_date }
    }

    /// Start of range as epoch milliseconds (UTC midnight)
    pub fn start_millis(&self) -> i64 {
        self.start_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or_default()
    }

    /// End of range as epoch milliseconds (UTC midnight)
    pub fn end_millis(&self) -> i64 {
        self.end_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or_default()
    }

    pub fn days_count(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }
}

/// Query parameters shared by every unit of a run
#[derive(Debug, Clone, PartialEq)]
pub struct FetchParams {
    pub date_range: DateRange,
    pub period_type: String,
    pub period: u32,
    pub frequency_type: String,
    pub frequency: u32,
    pub extended_hours: bool,
    pub need_previous_close: bool,
}

impl FetchParams {
    /// Identifies what a run asks for, e.g. `10year_1daily_2015-01-01_to_2024-12-31`.
    /// Progress and output files are scoped by it.
    pub fn run_key(&self) -> String {
        format!(
            "{}{}_{}{}{}_{}_to_{}",
            self.period,
            self.period_type,
            self.frequency,
            self.frequency_type,
            if self.extended_hours { "_ext" } else { "" },
            self.date_range.start_date.format("%Y-%m-%d"),
            self.date_range.end_date.format("%Y-%m-%d"),
        )
    }
}

/// One symbol's fetch job. Identity is the symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub symbol: String,
    pub params: FetchParams,
}

impl WorkUnit {
    pub fn new(symbol: impl Into<String>, params: FetchParams) -> Self {
        Self {
            symbol: symbol.into(),
            params,
        }
    }
}

/// Canonical OHLCV record. Values that could not be coerced are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub datetime: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

/// Ordered records for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct PriceHistory {
    pub symbol: String,
    pub records: Vec<PriceRecord>,
}

impl PriceHistory {
    /// First and last timestamps, if there are any records
    pub fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.records.first()?;
        let last = self.records.last()?;
        Some((first.datetime, last.datetime))
    }
}

/// Successful result of a work unit
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(PriceHistory),
    /// Remote reported nothing for the range. Terminal, counts as complete.
    NoData,
}

/// A finished fetch and how many attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSuccess {
    pub outcome: FetchOutcome,
    pub attempts: u32,
}

/// How a single unit ended in a run
#[derive(Debug, Clone, PartialEq)]
pub enum UnitStatus {
    Completed { records: usize },
    NoData,
    Failed {
        kind: FailureKind,
        attempts: u32,
        error: String,
    },
}

/// Outcome record the scheduler collects per symbol
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub symbol: String,
    pub status: UnitStatus,
}

impl UnitReport {
    pub fn failed(symbol: impl Into<String>, kind: FailureKind, attempts: u32, error: impl ToString) -> Self {
        Self {
            symbol: symbol.into(),
            status: UnitStatus::Failed {
                kind,
                attempts,
                error: error.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.status, UnitStatus::Failed { .. })
    }
}

/// Failed symbol as reported in the run summary
#[derive(Debug, Clone, PartialEq)]
pub struct FailedUnit {
    pub symbol: String,
    pub kind: FailureKind,
    pub attempts: u32,
    pub error: String,
}

/// Why a run stopped submitting before the symbol list was exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    CredentialsExhausted,
}

/// Result of a scheduler run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub total_symbols: usize,
    pub previously_completed: usize,
    pub completed_this_run: usize,
    pub no_data: usize,
    pub records_fetched: usize,
    pub failed: Vec<FailedUnit>,
    pub not_attempted: usize,
    pub completed_total: usize,
    pub stopped: Option<StopReason>,
}

impl RunSummary {
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Symbols still lacking a completion mark after this run
    pub fn remaining(&self) -> usize {
        self.total_symbols.saturating_sub(self.completed_total)
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total_symbols == 0 {
            return 100.0;
        }
        self.completed_total as f64 / self.total_symbols as f64 * 100.0
    }
}
