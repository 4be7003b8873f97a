//! Candle and gap value types plus the sort/dedup merge shared by the cache and manager.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn open_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.open_time_ms).single()
    }
}

/// Missing range inside a requested window. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeGap {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeGap {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }
}

/// Sorts ascending by open time and drops repeated timestamps.
///
/// The sort is stable, so for equal timestamps the candle that appeared first in
/// `rows` is kept and later ones are discarded without comparing OHLCV values.
/// Returns the deduplicated rows and the number of rows removed.
pub fn sort_and_dedup(mut rows: Vec<Candle>) -> (Vec<Candle>, u64) {
    rows.sort_by_key(|row| row.open_time_ms);

    let mut deduped: Vec<Candle> = Vec::with_capacity(rows.len());
    let mut duplicates_removed = 0u64;
    for row in rows {
        if deduped
            .last()
            .map(|existing| existing.open_time_ms == row.open_time_ms)
            .unwrap_or(false)
        {
            duplicates_removed += 1;
        } else {
            deduped.push(row);
        }
    }

    (deduped, duplicates_removed)
}

/// Merges two candle sets; on timestamp collisions `primary` wins.
pub fn merge_candles(primary: Vec<Candle>, secondary: Vec<Candle>) -> Vec<Candle> {
    let mut all = primary;
    all.extend(secondary);
    sort_and_dedup(all).0
}
