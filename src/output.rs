//! Per-symbol result artifacts

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::PersistenceError;
use crate::models::{FetchParams, PriceHistory};
use crate::persistence::write_atomic;

/// Receives each successfully fetched history before the unit is marked complete
#[cfg_attr(test, mockall::automock)]
pub trait ResultSink: Send + Sync {
    fn persist(&self, history: &PriceHistory, params: &FetchParams) -> Result<PathBuf, PersistenceError>;
}

#[derive(Serialize)]
struct CsvRow<'a> {
    symbol: &'a str,
    datetime: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
}

/// Writes one CSV file per symbol into a directory
#[derive(Debug, Clone)]
pub struct CsvSink {
    dir: PathBuf,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ResultSink for CsvSink {
    fn persist(&self, history: &PriceHistory, params: &FetchParams) -> Result<PathBuf, PersistenceError> {
        let path = self.dir.join(file_name(&history.symbol, params));

        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in &history.records {
            writer
                .serialize(CsvRow {
                    symbol: &history.symbol,
                    datetime: record.datetime.to_rfc3339(),
                    open: record.open,
                    high: record.high,
                    low: record.low,
                    close: record.close,
                    volume: record.volume,
                })
                .map_err(|e| PersistenceError::Serialize(e.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| PersistenceError::Serialize(e.to_string()))?;

        write_atomic(&path, &bytes)?;
        info!(
            symbol = %history.symbol,
            records = history.records.len(),
            path = %path.display(),
            "💾 Data saved"
        );
        Ok(path)
    }
}

/// `{symbol}_{period}{period_type}_{frequency}{frequency_type}[_ext]_{start}_to_{end}.csv`
pub fn file_name(symbol: &str, params: &FetchParams) -> String {
    format!("{}_{}.csv", symbol, params.run_key())
}
