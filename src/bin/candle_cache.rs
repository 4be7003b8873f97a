use std::time::Duration as StdDuration;

use candle_cache::{
    init_logging, log_app_start, logging_config_from_env, CandleCacheConfig, CandleRequest,
    DataManager, KlineInterval,
};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "candle_cache")]
#[command(about = "Cache-first historical candle loader for Binance spot", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load candles for a window, fetching only what the cache is missing
    Candles(RangeArgs),
    /// Report cache gaps for a window without calling the exchange
    Gaps(RangeArgs),
    /// Show cache coverage for one series
    Stats {
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1h")]
        interval: KlineInterval,
    },
    /// Delete cached candles older than the retention window
    Cleanup {
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
        days: u64,
    },
    /// Check exchange connectivity
    Ping,
    /// Fetch the latest traded price
    Price {
        #[arg(long)]
        symbol: String,
    },
}

#[derive(Args)]
struct RangeArgs {
    #[arg(long)]
    symbol: String,
    #[arg(long, default_value = "1h")]
    interval: KlineInterval,
    /// RFC3339, defaults to seven days ago
    #[arg(long)]
    start: Option<DateTime<Utc>>,
    /// RFC3339, defaults to now
    #[arg(long)]
    end: Option<DateTime<Utc>>,
}

impl RangeArgs {
    fn to_request(&self) -> CandleRequest {
        let now = Utc::now();
        let start = self.start.unwrap_or(now - Duration::days(7));
        let end = self.end.unwrap_or(now);
        CandleRequest::new(
            self.symbol.clone(),
            self.interval,
            start.timestamp_millis(),
            end.timestamp_millis(),
        )
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let cfg = CandleCacheConfig::from_env();
    log_app_start(&logging_cfg, &cfg, command_name(&cli.command));

    let manager = DataManager::from_config(&cfg)?;

    let output = match cli.command {
        Commands::Candles(args) => {
            let loaded = manager.get_candles(&args.to_request())?;
            serde_json::to_value(&loaded)?
        }
        Commands::Gaps(args) => {
            let req = args.to_request();
            let gaps = manager.audit_gaps(&req)?;
            json!({
                "symbol": req.symbol,
                "interval": req.interval.as_str(),
                "start_ms": req.start_ms,
                "end_ms": req.end_ms,
                "gap_count": gaps.len(),
                "gaps": gaps,
            })
        }
        Commands::Stats { symbol, interval } => {
            serde_json::to_value(manager.cache_stats(&symbol, interval)?)?
        }
        Commands::Cleanup { days } => {
            let retention = StdDuration::from_secs(days.saturating_mul(86_400));
            let deleted = manager.cleanup_old_candles(retention)?;
            json!({ "deleted_candles": deleted, "older_than_days": days })
        }
        Commands::Ping => {
            manager.test_connection()?;
            json!({ "status": "ok" })
        }
        Commands::Price { symbol } => {
            let price = manager.latest_price(&symbol)?;
            json!({ "symbol": symbol, "price": price })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Candles(_) => "candles",
        Commands::Gaps(_) => "gaps",
        Commands::Stats { .. } => "stats",
        Commands::Cleanup { .. } => "cleanup",
        Commands::Ping => "ping",
        Commands::Price { .. } => "price",
    }
}
