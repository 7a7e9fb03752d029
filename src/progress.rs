//! Durable record of completed symbols
//!
//! Backed by a single JSON file (`{"run": "...", "completed_tickers": [...]}`).
//! Every new completion rewrites the file atomically before `mark_complete`
//! returns, so a crash loses at most the unit that was in flight.
//!
//! `run` is the [`FetchParams::run_key`](crate::models::FetchParams::run_key) the
//! symbols were completed for. Progress recorded for a different run key is
//! discarded by [`ProgressLedger::begin_run`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::PersistenceError;
use crate::persistence::write_atomic;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run: Option<String>,
    #[serde(rename = "completed_tickers", default)]
    completed: Vec<String>,
}

#[derive(Debug, Default)]
struct LedgerState {
    run: Option<String>,
    completed: BTreeSet<String>,
}

/// Set of completed symbols for one run configuration
#[derive(Debug)]
pub struct ProgressLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl ProgressLedger {
    /// Open the ledger at `path`. A missing or malformed file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load_state(&path);
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run key the recorded progress belongs to, if known
    pub async fn run_key(&self) -> Option<String> {
        self.state.lock().await.run.clone()
    }

    /// Scope the ledger to `run_key` before any work is checked against it.
    ///
    /// Progress recorded for another run key is dropped, on disk and in memory.
    /// A file without a run key is adopted as is. On a write failure the new
    /// scope still applies in memory and the error is returned.
    pub async fn begin_run(&self, run_key: &str) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        let recorded = state.run.clone();
        match recorded.as_deref() {
            Some(current) if current == run_key => return Ok(()),
            Some(previous) => {
                warn!(
                    previous,
                    current = run_key,
                    discarded = state.completed.len(),
                    "⚠️ Progress file belongs to a different run configuration, starting fresh"
                );
                state.completed.clear();
            }
            None if !state.completed.is_empty() => {
                info!(run = run_key, completed = state.completed.len(), "Adopting progress file without a run key");
            }
            None => {}
        }
        state.run = Some(run_key.to_string());
        persist(&self.path, &state)
    }

    pub async fn is_complete(&self, symbol: &str) -> bool {
        self.state.lock().await.completed.contains(symbol)
    }

    /// Record `symbol` as complete and persist before returning.
    ///
    /// On a write failure the symbol stays complete in memory for this run and
    /// the error is returned for the caller to log.
    pub async fn mark_complete(&self, symbol: &str) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        if !state.completed.insert(symbol.to_string()) {
            return Ok(());
        }
        persist(&self.path, &state)?;
        debug!(symbol, completed = state.completed.len(), "Marked symbol complete");
        Ok(())
    }

    /// Symbols of `all_symbols` not yet complete, in input order, without duplicates
    pub async fn remaining(&self, all_symbols: &[String]) -> Vec<String> {
        let state = self.state.lock().await;
        let completed = &state.completed;
        let mut seen = HashSet::new();
        all_symbols
            .iter()
            .filter(|s| !completed.contains(s.as_str()) && seen.insert(s.as_str()))
            .cloned()
            .collect()
    }

    /// Fraction of `all_symbols` that is complete, in `[0, 1]`
    pub async fn completion_fraction(&self, all_symbols: &[String]) -> f64 {
        let unique: HashSet<&str> = all_symbols.iter().map(String::as_str).collect();
        if unique.is_empty() {
            return 1.0;
        }
        let state = self.state.lock().await;
        let completed = &state.completed;
        let done = unique.iter().filter(|s| completed.contains(**s)).count();
        done as f64 / unique.len() as f64
    }

    /// Number of `all_symbols` that are complete
    pub async fn completed_count(&self, all_symbols: &[String]) -> usize {
        let unique: HashSet<&str> = all_symbols.iter().map(String::as_str).collect();
        let state = self.state.lock().await;
        let completed = &state.completed;
        unique.iter().filter(|s| completed.contains(**s)).count()
    }

    /// Sorted snapshot of every completed symbol
    pub async fn completed(&self) -> Vec<String> {
        self.state.lock().await.completed.iter().cloned().collect()
    }

    /// Forget all progress, on disk and in memory
    pub async fn reset(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.completed.clear();
        persist(&self.path, &state)?;
        info!(path = %self.path.display(), "Progress ledger reset");
        Ok(())
    }
}

fn load_state(path: &Path) -> LedgerState {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No progress file, starting fresh");
            return LedgerState::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read progress file, starting fresh");
            return LedgerState::default();
        }
    };

    match serde_json::from_str::<LedgerFile>(&content) {
        Ok(file) => {
            let completed: BTreeSet<String> = file.completed.into_iter().collect();
            info!(
                path = %path.display(),
                run = file.run.as_deref().unwrap_or("-"),
                completed = completed.len(),
                "Loaded progress: symbols already processed"
            );
            LedgerState {
                run: file.run,
                completed,
            }
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Malformed progress file, starting fresh");
            LedgerState::default()
        }
    }
}

fn persist(path: &Path, state: &LedgerState) -> Result<(), PersistenceError> {
    let file = LedgerFile {
        run: state.run.clone(),
        completed: state.completed.iter().cloned().collect(),
    };
    let json = serde_json::to_string_pretty(&file)
        .map_err(|e| PersistenceError::Serialize(e.to_string()))?;
    write_atomic(path, json.as_bytes())
}
