//! Cached historical candle loading for Binance spot.
//!
//! Components:
//! - token-bucket rate limiter guarding every exchange call
//! - REST client with kline pagination around the per-request row cap
//! - SQLite candle cache with idempotent writes, stats and retention cleanup
//! - data manager that fetches only the ranges the cache is missing

mod cache;
mod cancel;
mod candle;
mod config;
mod exchange;
mod interval;
mod manager;
mod observability;
mod rate_limiter;
#[cfg(test)]
mod test_support;

pub use cache::{CacheError, CacheStats, CandleCache, SqliteCandleCache};
pub use cancel::{CancelToken, Cancelled};
pub use candle::{merge_candles, sort_and_dedup, Candle, TimeGap};
pub use config::{CandleCacheConfig, DEFAULT_STORE_PATH};
pub use exchange::{
    parse_kline_row, validate_symbol, ExchangeClient, ExchangeConfig, ExchangeError, HttpError,
    HttpResponse, HttpTransport, KlineQuery, KlineRowError, ReqwestBlockingTransport,
    BINANCE_REST_BASE_URL, MAX_KLINES_PER_REQUEST,
};
pub use interval::{parse_interval, IntervalError, KlineInterval, ALL_INTERVALS};
pub use manager::{find_missing_gaps, CandleLoadResult, CandleRequest, DataError, DataManager};
pub use observability::{
    init_logging, log_app_start, logging_config_from_env, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
