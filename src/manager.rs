//! Cache-first candle loading: read what is held, fetch only the gaps, persist, merge.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{CacheError, CacheStats, CandleCache, SqliteCandleCache};
use crate::cancel::{CancelToken, Cancelled};
use crate::candle::{merge_candles, sort_and_dedup, Candle, TimeGap};
use crate::config::CandleCacheConfig;
use crate::exchange::{validate_symbol, ExchangeClient, ExchangeError};
use crate::interval::KlineInterval;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleRequest {
    pub symbol: String,
    pub interval: KlineInterval,
    pub start_ms: i64,
    /// Inclusive.
    pub end_ms: i64,
}

impl CandleRequest {
    pub fn new(symbol: impl Into<String>, interval: KlineInterval, start_ms: i64, end_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            start_ms,
            end_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleLoadResult {
    pub symbol: String,
    pub interval: KlineInterval,
    pub candles: Vec<Candle>,
    pub cached_points: u64,
    pub fetched_points: u64,
    pub persisted_points: u64,
    pub gaps: Vec<TimeGap>,
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("invalid candle request: {0}")]
    InvalidRequest(String),
    #[error("failed to fetch gap {index}/{total} [{start_ms}, {end_ms}]: {source}")]
    GapFetch {
        index: usize,
        total: usize,
        start_ms: i64,
        end_ms: i64,
        #[source]
        source: ExchangeError,
    },
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

pub struct DataManager {
    exchange: ExchangeClient,
    cache: Box<dyn CandleCache>,
}

impl DataManager {
    pub fn new(exchange: ExchangeClient, cache: Box<dyn CandleCache>) -> Self {
        Self { exchange, cache }
    }

    /// Opens the SQLite cache and a live exchange client.
    pub fn from_config(cfg: &CandleCacheConfig) -> Result<Self, DataError> {
        let cache = SqliteCandleCache::open(&cfg.store_path)?;
        let exchange = ExchangeClient::new(&cfg.exchange)?;
        Ok(Self::new(exchange, Box::new(cache)))
    }

    pub fn exchange(&self) -> &ExchangeClient {
        &self.exchange
    }

    pub fn get_candles(&self, req: &CandleRequest) -> Result<CandleLoadResult, DataError> {
        self.get_candles_cancellable(req, &CancelToken::new())
    }

    /// Returns every candle in `[start_ms, end_ms]`, fetching only what the
    /// cache lacks.
    ///
    /// Each gap is persisted as soon as it is fetched, so when a later gap fails
    /// the error is returned but earlier gaps stay cached.
    pub fn get_candles_cancellable(
        &self,
        req: &CandleRequest,
        cancel: &CancelToken,
    ) -> Result<CandleLoadResult, DataError> {
        validate_request(req)?;
        let interval_ms = req.interval.duration_ms();

        let cached = match self
            .cache
            .read(&req.symbol, req.interval, req.start_ms, req.end_ms)
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(
                    component = "data_manager",
                    event = "candles.load.cache_read_failed",
                    symbol = %req.symbol,
                    interval = req.interval.as_str(),
                    error = %err
                );
                Vec::new()
            }
        };
        let (cached, _) = sort_and_dedup(cached);
        let cached_points = cached.len() as u64;

        let gaps = find_missing_gaps(&cached, req.start_ms, req.end_ms, interval_ms);
        if gaps.is_empty() {
            info!(
                component = "data_manager",
                event = "candles.load.cache_hit",
                symbol = %req.symbol,
                interval = req.interval.as_str(),
                candles = cached.len()
            );
            return Ok(CandleLoadResult {
                symbol: req.symbol.clone(),
                interval: req.interval,
                candles: cached,
                cached_points,
                fetched_points: 0,
                persisted_points: 0,
                gaps,
            });
        }

        info!(
            component = "data_manager",
            event = "candles.load.gaps_detected",
            symbol = %req.symbol,
            interval = req.interval.as_str(),
            cached_points,
            gap_count = gaps.len()
        );

        let total = gaps.len();
        let mut fetched = Vec::new();
        let mut persisted_points = 0u64;
        for (idx, gap) in gaps.iter().enumerate() {
            cancel.check()?;
            info!(
                component = "data_manager",
                event = "candles.load.gap_fetch",
                symbol = %req.symbol,
                interval = req.interval.as_str(),
                gap_index = idx + 1,
                gap_total = total,
                start_ms = gap.start_ms,
                end_ms = gap.end_ms
            );

            let gap_candles = self
                .exchange
                .fetch_range(&req.symbol, req.interval, gap.start_ms, gap.end_ms, cancel)
                .map_err(|source| match source {
                    ExchangeError::Cancelled(c) => DataError::Cancelled(c),
                    source => DataError::GapFetch {
                        index: idx + 1,
                        total,
                        start_ms: gap.start_ms,
                        end_ms: gap.end_ms,
                        source,
                    },
                })?;

            match self.cache.write(&req.symbol, req.interval, &gap_candles) {
                Ok(inserted) => persisted_points += inserted as u64,
                Err(err) => warn!(
                    component = "data_manager",
                    event = "candles.load.cache_write_failed",
                    symbol = %req.symbol,
                    interval = req.interval.as_str(),
                    candles = gap_candles.len(),
                    error = %err
                ),
            }
            fetched.extend(gap_candles);
        }

        let fetched_points = fetched.len() as u64;
        let candles = merge_candles(cached, fetched);

        info!(
            component = "data_manager",
            event = "candles.load.finish",
            symbol = %req.symbol,
            interval = req.interval.as_str(),
            total = candles.len(),
            cached_points,
            fetched_points,
            persisted_points
        );

        Ok(CandleLoadResult {
            symbol: req.symbol.clone(),
            interval: req.interval,
            candles,
            cached_points,
            fetched_points,
            persisted_points,
            gaps,
        })
    }

    /// Gaps the cache currently has for `req`, without touching the exchange.
    pub fn audit_gaps(&self, req: &CandleRequest) -> Result<Vec<TimeGap>, DataError> {
        validate_request(req)?;
        let cached = self
            .cache
            .read(&req.symbol, req.interval, req.start_ms, req.end_ms)?;
        let (cached, _) = sort_and_dedup(cached);
        Ok(find_missing_gaps(
            &cached,
            req.start_ms,
            req.end_ms,
            req.interval.duration_ms(),
        ))
    }

    pub fn cache_stats(
        &self,
        symbol: &str,
        interval: KlineInterval,
    ) -> Result<CacheStats, DataError> {
        Ok(self.cache.stats(symbol, interval)?)
    }

    /// Deletes cached candles of every series that opened before `now - retention`.
    pub fn cleanup_old_candles(&self, retention: Duration) -> Result<u64, DataError> {
        let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff_ms = Utc::now().timestamp_millis().saturating_sub(retention_ms);
        let deleted = self.cache.cleanup_before(cutoff_ms)?;
        info!(
            component = "data_manager",
            event = "candles.cleanup.finish",
            cutoff_ms,
            deleted
        );
        Ok(deleted)
    }

    pub fn test_connection(&self) -> Result<(), DataError> {
        Ok(self.exchange.test_connection()?)
    }

    pub fn latest_price(&self, symbol: &str) -> Result<f64, DataError> {
        Ok(self.exchange.latest_price(symbol)?)
    }
}

/// Missing ranges of `[start_ms, end_ms]` given sorted, deduplicated `cached` rows.
///
/// One interval of spacing between neighbours is normal; a hole is reported
/// only when the next bar is more than two intervals after the current one.
pub fn find_missing_gaps(
    cached: &[Candle],
    start_ms: i64,
    end_ms: i64,
    interval_ms: i64,
) -> Vec<TimeGap> {
    let (Some(first), Some(last)) = (cached.first(), cached.last()) else {
        return vec![TimeGap::new(start_ms, end_ms)];
    };

    let mut gaps = Vec::new();

    let first_ms = first.open_time_ms;
    if start_ms < first_ms - interval_ms {
        gaps.push(TimeGap::new(start_ms, first_ms - interval_ms));
    }

    for pair in cached.windows(2) {
        let current_ms = pair[0].open_time_ms;
        let next_ms = pair[1].open_time_ms;
        let expected_next_ms = current_ms + interval_ms;
        if next_ms > expected_next_ms + interval_ms {
            gaps.push(TimeGap::new(expected_next_ms, next_ms - interval_ms));
        }
    }

    let last_ms = last.open_time_ms;
    if end_ms > last_ms + interval_ms {
        gaps.push(TimeGap::new(last_ms + interval_ms, end_ms));
    }

    gaps
}

fn validate_request(req: &CandleRequest) -> Result<(), DataError> {
    validate_symbol(&req.symbol)?;
    if req.end_ms < req.start_ms {
        return Err(DataError::InvalidRequest(format!(
            "end_ms {} is before start_ms {}",
            req.end_ms, req.start_ms
        )));
    }
    for ts in [req.start_ms, req.end_ms] {
        if Utc.timestamp_millis_opt(ts).single().is_none() {
            return Err(DataError::InvalidRequest(format!(
                "timestamp {ts} is not a valid UTC instant"
            )));
        }
    }
    Ok(())
}
