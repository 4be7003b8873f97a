//! Durable candle cache keyed by (symbol, interval, open_time_ms).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::candle::Candle;
use crate::interval::KlineInterval;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub symbol: String,
    pub interval: KlineInterval,
    pub total_candles: u64,
    pub first_candle_ms: Option<i64>,
    pub last_candle_ms: Option<i64>,
    pub first_cached_at_ms: Option<i64>,
    pub last_cached_at_ms: Option<i64>,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Storage seam for the data manager.
pub trait CandleCache: Send + Sync {
    /// Candles with `start_ms <= open_time_ms <= end_ms`, ascending.
    fn read(
        &self,
        symbol: &str,
        interval: KlineInterval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, CacheError>;

    /// Inserts in one transaction, ignoring rows whose key already exists.
    /// Returns the number of rows actually inserted.
    fn write(
        &self,
        symbol: &str,
        interval: KlineInterval,
        candles: &[Candle],
    ) -> Result<usize, CacheError>;

    fn stats(&self, symbol: &str, interval: KlineInterval) -> Result<CacheStats, CacheError>;

    /// Deletes rows of every series with `open_time_ms < cutoff_ms`.
    fn cleanup_before(&self, cutoff_ms: i64) -> Result<u64, CacheError>;
}

pub struct SqliteCandleCache {
    conn: Mutex<Connection>,
}

impl SqliteCandleCache {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            PRAGMA busy_timeout=5000;
            ",
        )?;
        ensure_schema(&conn)?;
        info!(
            component = "cache",
            event = "cache.open",
            path = %path.display()
        );

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.conn
            .lock()
            .map_err(|_| CacheError::Unavailable("connection lock poisoned".to_string()))
    }
}

impl CandleCache for SqliteCandleCache {
    fn read(
        &self,
        symbol: &str,
        interval: KlineInterval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, CacheError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "
            SELECT open_time_ms, open, high, low, close, volume
            FROM historical_candles
            WHERE symbol = ?1
              AND interval = ?2
              AND open_time_ms >= ?3
              AND open_time_ms <= ?4
            ORDER BY open_time_ms ASC
            ",
        )?;

        let rows = stmt.query_map(
            params![symbol, interval.as_str(), start_ms, end_ms],
            |row| {
                Ok(Candle {
                    open_time_ms: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            },
        )?;

        let candles = rows.collect::<Result<Vec<_>, _>>()?;
        debug!(
            component = "cache",
            event = "cache.read",
            symbol,
            interval = interval.as_str(),
            start_ms,
            end_ms,
            candles = candles.len()
        );
        Ok(candles)
    }

    fn write(
        &self,
        symbol: &str,
        interval: KlineInterval,
        candles: &[Candle],
    ) -> Result<usize, CacheError> {
        if candles.is_empty() {
            return Ok(0);
        }

        let created_at_ms = Utc::now().timestamp_millis();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        let mut skipped = 0usize;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR IGNORE INTO historical_candles (
                    symbol,
                    interval,
                    open_time_ms,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    created_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ",
            )?;

            for candle in candles {
                match stmt.execute(params![
                    symbol,
                    interval.as_str(),
                    candle.open_time_ms,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                    created_at_ms,
                ]) {
                    Ok(changed) => inserted += changed,
                    Err(err) => {
                        skipped += 1;
                        warn!(
                            component = "cache",
                            event = "cache.write.row_failed",
                            symbol,
                            interval = interval.as_str(),
                            open_time_ms = candle.open_time_ms,
                            error = %err
                        );
                    }
                }
            }
        }
        tx.commit()?;

        info!(
            component = "cache",
            event = "cache.write.finish",
            symbol,
            interval = interval.as_str(),
            offered = candles.len(),
            inserted,
            skipped
        );
        Ok(inserted)
    }

    fn stats(&self, symbol: &str, interval: KlineInterval) -> Result<CacheStats, CacheError> {
        let conn = self.lock()?;
        let (total, first, last, first_cached, last_cached): (
            i64,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
        ) = conn.query_row(
            "
            SELECT
                COUNT(*),
                MIN(open_time_ms),
                MAX(open_time_ms),
                MIN(created_at_ms),
                MAX(created_at_ms)
            FROM historical_candles
            WHERE symbol = ?1 AND interval = ?2
            ",
            params![symbol, interval.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        Ok(CacheStats {
            symbol: symbol.to_string(),
            interval,
            total_candles: total.max(0) as u64,
            first_candle_ms: first,
            last_candle_ms: last,
            first_cached_at_ms: first_cached,
            last_cached_at_ms: last_cached,
        })
    }

    fn cleanup_before(&self, cutoff_ms: i64) -> Result<u64, CacheError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM historical_candles WHERE open_time_ms < ?1",
            params![cutoff_ms],
        )?;
        info!(
            component = "cache",
            event = "cache.cleanup.finish",
            cutoff_ms,
            deleted
        );
        Ok(deleted as u64)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS historical_candles (
            symbol TEXT NOT NULL,
            interval TEXT NOT NULL,
            open_time_ms INTEGER NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            volume REAL NOT NULL,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY(symbol, interval, open_time_ms)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}
