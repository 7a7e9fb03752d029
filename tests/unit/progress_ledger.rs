//! Crash-safety checks for the progress ledger

use pretty_assertions::assert_eq;
use std::sync::Arc;

use crate::common::logging::{init_test_logging, log_test_step};
use crate::common::test_data::symbols;
use price_history_fetcher::ProgressLedger;

#[tokio::test]
async fn test_completion_visible_to_fresh_process() {
    init_test_logging();
    log_test_step("Reopening the ledger right after mark_complete returns");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");

    let ledger = ProgressLedger::open(&path);
    ledger.mark_complete("MSFT").await.unwrap();
    // No explicit flush or close: the file must already be durable
    let reopened = ProgressLedger::open(&path);
    assert!(reopened.is_complete("MSFT").await);
    assert!(ledger.is_complete("MSFT").await);
}

#[tokio::test]
async fn test_interrupted_write_leaves_previous_set() {
    init_test_logging();
    log_test_step("Stray partial temp file next to the ledger");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    {
        let ledger = ProgressLedger::open(&path);
        ledger.mark_complete("AAA").await.unwrap();
        ledger.mark_complete("BBB").await.unwrap();
    }
    // What a kill between temp-file write and rename leaves behind
    std::fs::write(dir.path().join(".tmpA1b2C3"), "{\"completed_tickers\": [\"AAA\", \"BB").unwrap();

    let ledger = ProgressLedger::open(&path);
    assert_eq!(ledger.completed().await, symbols(&["AAA", "BBB"]));

    let raw = std::fs::read_to_string(&path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["completed_tickers"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_marks_from_many_tasks() {
    init_test_logging();
    log_test_step("Concurrent mark_complete on a multi-threaded runtime");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    let ledger = Arc::new(ProgressLedger::open(&path));
    let all: Vec<String> = (0..100).map(|i| format!("SYM{i:03}")).collect();

    let mut handles = Vec::new();
    for chunk in all.chunks(10) {
        let ledger = ledger.clone();
        let chunk = chunk.to_vec();
        handles.push(tokio::spawn(async move {
            for symbol in chunk {
                ledger.mark_complete(&symbol).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let reopened = ProgressLedger::open(&path);
    assert_eq!(reopened.completed().await, all);
    assert_eq!(reopened.completion_fraction(&all).await, 1.0);
    assert!(reopened.remaining(&all).await.is_empty());
}
