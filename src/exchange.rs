//! Rate-limited Binance spot REST client for klines, ticker price and ping.

use std::fmt::Write as _;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::{CancelToken, Cancelled};
use crate::candle::Candle;
use crate::interval::KlineInterval;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};

pub const BINANCE_REST_BASE_URL: &str = "https://api.binance.com";
pub const MAX_KLINES_PER_REQUEST: u32 = 1_000;

const KLINES_PATH: &str = "/api/v3/klines";
const TICKER_PRICE_PATH: &str = "/api/v3/ticker/price";
const PING_PATH: &str = "/api/v3/ping";
const MIN_KLINE_FIELDS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub http_timeout_ms: u64,
    pub max_batch_limit: u32,
    pub rate_limit: RateLimiterConfig,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: BINANCE_REST_BASE_URL.to_string(),
            http_timeout_ms: 30_000,
            max_batch_limit: MAX_KLINES_PER_REQUEST,
            rate_limit: RateLimiterConfig::default(),
        }
    }
}

/// One kline request. `limit` is clamped to the configured cap; zero omits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlineQuery {
    pub symbol: String,
    pub interval: KlineInterval,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("HTTP request failed for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("exchange returned HTTP {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("invalid symbol '{0}': expected non-empty ASCII alphanumeric")]
    InvalidSymbol(String),
    #[error(
        "klines request failed for {symbol} {interval} (start={start_ms:?}, end={end_ms:?}): {source}"
    )]
    Klines {
        symbol: String,
        interval: KlineInterval,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        #[source]
        source: HttpError,
    },
    #[error("kline cursor did not advance for {symbol} {interval} at {cursor_ms}")]
    CursorStalled {
        symbol: String,
        interval: KlineInterval,
        cursor_ms: i64,
    },
    #[error("ticker price request failed for {symbol}: {source}")]
    Ticker {
        symbol: String,
        #[source]
        source: HttpError,
    },
    #[error("invalid price '{value}' for {symbol}")]
    InvalidPrice { symbol: String, value: String },
    #[error("exchange ping failed: {0}")]
    Ping(#[source] HttpError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Reasons a single kline row is rejected. Rows are skipped, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KlineRowError {
    #[error("kline row is not an array")]
    NotArray,
    #[error("kline row has {found} fields, expected at least {expected}")]
    TooShort { found: usize, expected: usize },
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
}

/// Blocking GET against a fully built URL.
///
/// Non-2xx statuses are returned as responses, not errors, so the client can
/// surface the provider's error body.
pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError>;
}

pub struct ReqwestBlockingTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingTransport {
    pub fn new(timeout_ms: u64) -> Result<Self, ExchangeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| ExchangeError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestBlockingTransport {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| HttpError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| HttpError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        Ok(HttpResponse { status, body })
    }
}

pub struct ExchangeClient {
    base_url: String,
    max_batch_limit: u32,
    limiter: RateLimiter,
    transport: Box<dyn HttpTransport>,
}

impl ExchangeClient {
    pub fn new(cfg: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let transport = ReqwestBlockingTransport::new(cfg.http_timeout_ms)?;
        Ok(Self::with_transport(cfg, Box::new(transport)))
    }

    pub fn with_transport(cfg: &ExchangeConfig, transport: Box<dyn HttpTransport>) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            max_batch_limit: cfg.max_batch_limit.clamp(1, MAX_KLINES_PER_REQUEST),
            limiter: RateLimiter::new(cfg.rate_limit),
            transport,
        }
    }

    pub fn max_batch_limit(&self) -> u32 {
        self.max_batch_limit
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Issues one klines call. Unparsable rows are logged and dropped.
    pub fn fetch_batch(
        &self,
        query: &KlineQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.fetch_batch_raw(query, cancel).map(|(candles, _)| candles)
    }

    /// Parsed candles plus the number of rows the exchange actually sent.
    fn fetch_batch_raw(
        &self,
        query: &KlineQuery,
        cancel: &CancelToken,
    ) -> Result<(Vec<Candle>, usize), ExchangeError> {
        validate_symbol(&query.symbol)?;
        self.limiter.wait_cancellable(cancel)?;

        let limit = query.limit.min(self.max_batch_limit);
        let url = self.klines_url(query, limit);
        let wrap = |source: HttpError| ExchangeError::Klines {
            symbol: query.symbol.clone(),
            interval: query.interval,
            start_ms: query.start_ms,
            end_ms: query.end_ms,
            source,
        };

        debug!(
            component = "exchange",
            event = "exchange.klines.fetch",
            symbol = %query.symbol,
            interval = query.interval.as_str(),
            start_ms = ?query.start_ms,
            end_ms = ?query.end_ms,
            limit
        );

        let body = self.get_success(&url).map_err(wrap)?;
        let rows: Vec<serde_json::Value> =
            serde_json::from_slice(&body).map_err(|err| {
                wrap(HttpError::Decode {
                    url: url.clone(),
                    message: err.to_string(),
                })
            })?;

        let mut candles = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            match parse_kline_row(row) {
                Ok(candle) => candles.push(candle),
                Err(err) => warn!(
                    component = "exchange",
                    event = "exchange.klines.row_skipped",
                    symbol = %query.symbol,
                    interval = query.interval.as_str(),
                    row_index = idx,
                    error = %err
                ),
            }
        }

        debug!(
            component = "exchange",
            event = "exchange.klines.fetched",
            symbol = %query.symbol,
            interval = query.interval.as_str(),
            raw_rows = rows.len(),
            candles = candles.len()
        );

        Ok((candles, rows.len()))
    }

    /// Paginates `fetch_batch` over `[start_ms, end_ms]` (inclusive).
    ///
    /// Stops on an empty batch, a batch shorter than the cap, or once the cursor
    /// moves past `end_ms`. Skipped rows still count toward the page size, so a
    /// malformed row inside a full page does not end pagination early. A page
    /// where no row parses is an error.
    pub fn fetch_range(
        &self,
        symbol: &str,
        interval: KlineInterval,
        start_ms: i64,
        end_ms: i64,
        cancel: &CancelToken,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let step_ms = interval.duration_ms();
        let limit = self.max_batch_limit;
        let mut all = Vec::new();
        let mut cursor = start_ms;
        let mut batches = 0u32;

        while cursor <= end_ms {
            cancel.check()?;
            let query = KlineQuery {
                symbol: symbol.to_string(),
                interval,
                start_ms: Some(cursor),
                end_ms: Some(end_ms),
                limit,
            };
            let (batch, raw_rows) = self.fetch_batch_raw(&query, cancel)?;
            batches += 1;

            if raw_rows == 0 {
                break;
            }
            let Some(last_open) = batch.last().map(|c| c.open_time_ms) else {
                // Every row was malformed; there is no bar to advance from.
                return Err(ExchangeError::CursorStalled {
                    symbol: symbol.to_string(),
                    interval,
                    cursor_ms: cursor,
                });
            };
            all.extend(batch);

            let next_cursor = last_open.saturating_add(step_ms);
            if next_cursor <= cursor {
                return Err(ExchangeError::CursorStalled {
                    symbol: symbol.to_string(),
                    interval,
                    cursor_ms: cursor,
                });
            }
            cursor = next_cursor;

            // Short pages are judged on rows sent, not rows parsed.
            if raw_rows < limit as usize {
                break;
            }
            debug!(
                component = "exchange",
                event = "exchange.range.page",
                symbol,
                interval = interval.as_str(),
                total = all.len(),
                next_cursor_ms = cursor
            );
        }

        info!(
            component = "exchange",
            event = "exchange.range.finish",
            symbol,
            interval = interval.as_str(),
            start_ms,
            end_ms,
            batches,
            candles = all.len()
        );

        Ok(all)
    }

    pub fn latest_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        validate_symbol(symbol)?;
        self.limiter.wait();

        let url = format!("{}{TICKER_PRICE_PATH}?symbol={symbol}", self.base_url);
        let wrap = |source: HttpError| ExchangeError::Ticker {
            symbol: symbol.to_string(),
            source,
        };
        let body = self.get_success(&url).map_err(wrap)?;
        let ticker: TickerPrice = serde_json::from_slice(&body).map_err(|err| {
            wrap(HttpError::Decode {
                url: url.clone(),
                message: err.to_string(),
            })
        })?;

        ticker
            .price
            .parse::<f64>()
            .map_err(|_| ExchangeError::InvalidPrice {
                symbol: symbol.to_string(),
                value: ticker.price.clone(),
            })
    }

    pub fn test_connection(&self) -> Result<(), ExchangeError> {
        self.limiter.wait();
        let url = format!("{}{PING_PATH}", self.base_url);
        self.get_success(&url).map_err(ExchangeError::Ping)?;
        info!(component = "exchange", event = "exchange.ping.ok");
        Ok(())
    }

    fn get_success(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        let response = self.transport.get(url)?;
        if !response.is_success() {
            return Err(HttpError::Status {
                url: url.to_string(),
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }
        Ok(response.body)
    }

    fn klines_url(&self, query: &KlineQuery, limit: u32) -> String {
        let mut url = format!(
            "{}{KLINES_PATH}?symbol={}&interval={}",
            self.base_url,
            query.symbol,
            query.interval.as_str()
        );
        // Writing to a String cannot fail.
        if let Some(start) = query.start_ms {
            let _ = write!(url, "&startTime={start}");
        }
        if let Some(end) = query.end_ms {
            let _ = write!(url, "&endTime={end}");
        }
        if limit > 0 {
            let _ = write!(url, "&limit={limit}");
        }
        url
    }
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

pub fn validate_symbol(symbol: &str) -> Result<(), ExchangeError> {
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ExchangeError::InvalidSymbol(symbol.to_string()));
    }
    Ok(())
}

/// Parses `[open_time, open, high, low, close, volume, ...]`.
pub fn parse_kline_row(value: &serde_json::Value) -> Result<Candle, KlineRowError> {
    let row = value.as_array().ok_or(KlineRowError::NotArray)?;
    if row.len() < MIN_KLINE_FIELDS {
        return Err(KlineRowError::TooShort {
            found: row.len(),
            expected: MIN_KLINE_FIELDS,
        });
    }

    Ok(Candle {
        open_time_ms: json_i64(&row[0], "open_time_ms")?,
        open: json_f64(&row[1], "open")?,
        high: json_f64(&row[2], "high")?,
        low: json_f64(&row[3], "low")?,
        close: json_f64(&row[4], "close")?,
        volume: json_f64(&row[5], "volume")?,
    })
}

fn json_i64(value: &serde_json::Value, field: &'static str) -> Result<i64, KlineRowError> {
    if let Some(v) = value.as_i64() {
        return Ok(v);
    }
    value
        .as_str()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| KlineRowError::ParseField {
            field,
            value: value.to_string(),
        })
}

fn json_f64(value: &serde_json::Value, field: &'static str) -> Result<f64, KlineRowError> {
    if let Some(v) = value.as_f64() {
        return Ok(v);
    }
    value
        .as_str()
        .and_then(|text| text.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .ok_or_else(|| KlineRowError::ParseField {
            field,
            value: value.to_string(),
        })
}
