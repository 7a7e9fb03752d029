//! Candle parsing into the canonical record schema

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::RawPriceHistory;
use crate::models::{FetchOutcome, PriceHistory, PriceRecord};

/// Convert a raw response into records, or `NoData` when the remote had nothing.
///
/// Candles without a usable `datetime` are dropped; numeric fields that cannot
/// be read as a number become `None`.
pub fn parse_price_history(symbol: &str, raw: &RawPriceHistory) -> FetchOutcome {
    if raw.is_empty() {
        return FetchOutcome::NoData;
    }

    let mut records = Vec::with_capacity(raw.candles.len());
    let mut dropped = 0usize;

    for candle in &raw.candles {
        match parse_candle(candle) {
            Some(record) => records.push(record),
            None => dropped += 1,
        }
    }

    if dropped > 0 {
        warn!(symbol, dropped, "Dropped candles without a valid datetime");
    }
    if records.is_empty() {
        return FetchOutcome::NoData;
    }

    records.sort_by_key(|r| r.datetime);
    debug!(symbol, records = records.len(), "Parsed price history");

    FetchOutcome::Fetched(PriceHistory {
        symbol: symbol.to_string(),
        records,
    })
}

fn parse_candle(candle: &Value) -> Option<PriceRecord> {
    let obj = candle.as_object()?;
    let datetime = obj.get("datetime").and_then(parse_timestamp)?;

    Some(PriceRecord {
        datetime,
        open: obj.get("open").and_then(coerce_number),
        high: obj.get("high").and_then(coerce_number),
        low: obj.get("low").and_then(coerce_number),
        close: obj.get("close").and_then(coerce_number),
        volume: obj.get("volume").and_then(coerce_number),
    })
}

/// Epoch milliseconds, as a number or numeric string
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp_millis(millis)
}

fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}
