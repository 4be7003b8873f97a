mod common;

use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use candle_cache::{
    log_app_start, CancelToken, CandleCache, CandleCacheConfig, CandleRequest, ExchangeClient,
    ExchangeConfig, KlineInterval, KlineQuery, LoggingConfig, RateLimiter, RateLimiterConfig,
    SqliteCandleCache,
};
use common::{
    fast_exchange_config, manager_with, minute_bars, MockExchange, MINUTE_MS, START_TS_MS,
};
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn request(last_minute: i64) -> CandleRequest {
    CandleRequest::new(
        "BTCUSDT",
        KlineInterval::M1,
        START_TS_MS,
        START_TS_MS + last_minute * MINUTE_MS,
    )
}

#[test]
fn gap_fill_emits_fetch_and_persist_events() {
    let mock = MockExchange::with_series(START_TS_MS, 30, MINUTE_MS)
        .corrupt_rows(&[START_TS_MS + 3 * MINUTE_MS]);
    let manager = manager_with(&mock, SqliteCandleCache::open_in_memory().unwrap());

    let logs = capture_logs(Level::INFO, || {
        manager
            .get_candles(&request(29))
            .expect("mock exchange should serve the window");
    });

    assert!(logs.contains("\"event\":\"candles.load.gaps_detected\""));
    assert!(logs.contains("\"event\":\"candles.load.gap_fetch\""));
    assert!(logs.contains("\"event\":\"exchange.klines.row_skipped\""));
    assert!(logs.contains("\"event\":\"cache.write.finish\""));
    assert!(logs.contains("\"event\":\"candles.load.finish\""));
}

#[test]
fn fully_cached_window_logs_cache_hit() {
    let mock = MockExchange::default();
    let cache = SqliteCandleCache::open_in_memory().unwrap();
    cache
        .write("BTCUSDT", KlineInterval::M1, &minute_bars(START_TS_MS, 10, 1.0))
        .unwrap();
    let manager = manager_with(&mock, cache);

    let logs = capture_logs(Level::INFO, || {
        manager
            .get_candles(&request(9))
            .expect("cached window should load");
    });

    assert!(logs.contains("\"event\":\"candles.load.cache_hit\""));
    assert!(!logs.contains("\"event\":\"candles.load.gap_fetch\""));
}

#[test]
fn exchange_failure_is_logged_with_status() {
    let mock = MockExchange::with_series(START_TS_MS, 10, MINUTE_MS).fail_from(START_TS_MS);
    let manager = manager_with(&mock, SqliteCandleCache::open_in_memory().unwrap());

    let logs = capture_logs(Level::INFO, || {
        manager
            .get_candles(&request(9))
            .expect_err("500 from the exchange should surface");
    });

    assert!(logs.contains("\"event\":\"candles.load.gap_fetch\""));
    assert!(!logs.contains("\"event\":\"candles.load.finish\""));
}

#[test]
fn throttled_waits_log_at_debug() {
    let limiter = RateLimiter::new(RateLimiterConfig {
        max_tokens: 1,
        refill_per_sec: 50,
        poll_interval_ms: 5,
    });

    let logs = capture_logs(Level::DEBUG, || {
        limiter.wait();
        limiter.wait();
    });

    assert!(logs.contains("\"event\":\"rate_limiter.throttled\""));
}

#[test]
fn throttled_kline_fetches_log_at_debug() {
    let mock = MockExchange::with_series(START_TS_MS, 10, MINUTE_MS);
    let cfg = ExchangeConfig {
        rate_limit: RateLimiterConfig {
            max_tokens: 1,
            refill_per_sec: 50,
            poll_interval_ms: 5,
        },
        ..fast_exchange_config()
    };
    let client = ExchangeClient::with_transport(&cfg, Box::new(mock.clone()));
    let query = KlineQuery {
        symbol: "BTCUSDT".to_string(),
        interval: KlineInterval::M1,
        start_ms: Some(START_TS_MS),
        end_ms: Some(START_TS_MS + 9 * MINUTE_MS),
        limit: 1_000,
    };

    let logs = capture_logs(Level::DEBUG, || {
        let cancel = CancelToken::new();
        client.fetch_batch(&query, &cancel).expect("first batch");
        client.fetch_batch(&query, &cancel).expect("second batch");
    });

    assert_eq!(mock.kline_calls().len(), 2);
    assert!(logs.contains("\"event\":\"rate_limiter.throttled\""));
}

#[test]
fn startup_helper_emits_baseline_event() {
    let logs = capture_logs(Level::INFO, || {
        log_app_start(
            &LoggingConfig::default(),
            &CandleCacheConfig::default(),
            "candles",
        );
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"command\":\"candles\""));
}
