#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use candle_cache::{
    Candle, DataManager, ExchangeClient, ExchangeConfig, HttpError, HttpResponse, HttpTransport,
    RateLimiterConfig, SqliteCandleCache,
};

pub const MINUTE_MS: i64 = 60_000;
pub const START_TS_MS: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z

/// In-process exchange serving a fixed kline series and recording every URL.
#[derive(Clone, Default)]
pub struct MockExchange {
    bars: Arc<Mutex<BTreeMap<i64, f64>>>,
    pub calls: Arc<Mutex<Vec<String>>>,
    fail_from_start_ms: Arc<Mutex<Option<i64>>>,
    bad_rows_at: Arc<Mutex<HashSet<i64>>>,
}

impl MockExchange {
    pub fn with_series(start_ms: i64, count: i64, step_ms: i64) -> Self {
        let mock = Self::default();
        {
            let mut bars = mock.bars.lock().unwrap();
            for i in 0..count {
                bars.insert(start_ms + i * step_ms, 100.0 + i as f64);
            }
        }
        mock
    }

    /// Any klines request whose startTime is at or after `start_ms` returns HTTP 500.
    pub fn fail_from(self, start_ms: i64) -> Self {
        *self.fail_from_start_ms.lock().unwrap() = Some(start_ms);
        self
    }

    /// Rows at these open times are served with an unparsable close price.
    pub fn corrupt_rows(self, times: &[i64]) -> Self {
        self.bad_rows_at.lock().unwrap().extend(times.iter().copied());
        self
    }

    pub fn kline_calls(&self) -> Vec<BTreeMap<String, String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.contains("/api/v3/klines"))
            .map(|url| query_params(url))
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn klines(&self, params: &BTreeMap<String, String>) -> HttpResponse {
        let start = params
            .get("startTime")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(i64::MIN);
        let end = params
            .get("endTime")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(i64::MAX);
        let limit = params
            .get("limit")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(500);

        if let Some(fail_from) = *self.fail_from_start_ms.lock().unwrap() {
            if start >= fail_from {
                return HttpResponse {
                    status: 500,
                    body: br#"{"code":-1000,"msg":"An unknown error occurred."}"#.to_vec(),
                };
            }
        }

        let bad = self.bad_rows_at.lock().unwrap().clone();
        let rows: Vec<serde_json::Value> = self
            .bars
            .lock()
            .unwrap()
            .range(start..=end)
            .take(limit)
            .map(|(&ts, &price)| {
                let close = if bad.contains(&ts) {
                    "not-a-number".to_string()
                } else {
                    format!("{:.2}", price + 0.5)
                };
                serde_json::json!([
                    ts,
                    format!("{price:.2}"),
                    format!("{:.2}", price + 1.0),
                    format!("{:.2}", price - 1.0),
                    close,
                    "10.0",
                    ts + 59_999,
                    "1000.0",
                    42,
                    "5.0",
                    "500.0",
                    "0"
                ])
            })
            .collect();

        HttpResponse {
            status: 200,
            body: serde_json::to_vec(&rows).unwrap(),
        }
    }
}

impl HttpTransport for MockExchange {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        self.calls.lock().unwrap().push(url.to_string());
        let path = url
            .split('?')
            .next()
            .unwrap_or_default()
            .trim_start_matches("http://mock");

        let response = match path {
            "/api/v3/klines" => self.klines(&query_params(url)),
            "/api/v3/ping" => HttpResponse {
                status: 200,
                body: b"{}".to_vec(),
            },
            "/api/v3/ticker/price" => {
                let symbol = query_params(url).get("symbol").cloned().unwrap_or_default();
                HttpResponse {
                    status: 200,
                    body: format!(r#"{{"symbol":"{symbol}","price":"42123.45000000"}}"#)
                        .into_bytes(),
                }
            }
            _ => HttpResponse {
                status: 404,
                body: b"not found".to_vec(),
            },
        };
        Ok(response)
    }
}

pub fn query_params(url: &str) -> BTreeMap<String, String> {
    url.split_once('?')
        .map(|(_, query)| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

pub fn fast_exchange_config() -> ExchangeConfig {
    ExchangeConfig {
        base_url: "http://mock".to_string(),
        rate_limit: RateLimiterConfig {
            max_tokens: 1_000,
            refill_per_sec: 1_000,
            poll_interval_ms: 1,
        },
        ..ExchangeConfig::default()
    }
}

pub fn manager_with(mock: &MockExchange, cache: SqliteCandleCache) -> DataManager {
    let exchange = ExchangeClient::with_transport(&fast_exchange_config(), Box::new(mock.clone()));
    DataManager::new(exchange, Box::new(cache))
}

pub fn candle(ts: i64, close: f64) -> Candle {
    Candle {
        open_time_ms: ts,
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 1.0,
    }
}

pub fn minute_bars(start_ms: i64, count: i64, close: f64) -> Vec<Candle> {
    (0..count)
        .map(|i| candle(start_ms + i * MINUTE_MS, close))
        .collect()
}
