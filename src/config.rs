//! Runtime configuration assembled from defaults plus `CANDLE_CACHE_*` env overrides.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::exchange::ExchangeConfig;

pub const DEFAULT_STORE_PATH: &str = "data/candles.sqlite";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandleCacheConfig {
    pub store_path: PathBuf,
    pub exchange: ExchangeConfig,
}

impl Default for CandleCacheConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            exchange: ExchangeConfig::default(),
        }
    }
}

impl CandleCacheConfig {
    /// Unset, empty or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(path) = env_string("CANDLE_CACHE_STORE_PATH") {
            cfg.store_path = PathBuf::from(path);
        }
        if let Some(base_url) = env_string("CANDLE_CACHE_BASE_URL") {
            cfg.exchange.base_url = base_url;
        }
        if let Some(timeout_ms) = env_parse("CANDLE_CACHE_HTTP_TIMEOUT_MS") {
            cfg.exchange.http_timeout_ms = timeout_ms;
        }
        if let Some(max_tokens) = env_parse::<u32>("CANDLE_CACHE_MAX_TOKENS") {
            if max_tokens > 0 {
                cfg.exchange.rate_limit.max_tokens = max_tokens;
            }
        }
        if let Some(refill) = env_parse::<u32>("CANDLE_CACHE_REFILL_PER_SEC") {
            if refill > 0 {
                cfg.exchange.rate_limit.refill_per_sec = refill;
            }
        }
        if let Some(poll_ms) = env_parse("CANDLE_CACHE_POLL_INTERVAL_MS") {
            cfg.exchange.rate_limit.poll_interval_ms = poll_ms;
        }

        cfg
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|raw| raw.parse().ok())
}
