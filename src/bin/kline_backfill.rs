use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kline_sync::{
    check_connectivity, init_all_tables, init_logging, load_env_file, logging_config_from_env,
    AppConfig, BinanceFeed, EngineState, LogBuffer, SqliteKlineStore, TimeNormalizer,
    UpdateEngine,
};

#[derive(Parser)]
#[command(
    name = "kline_backfill",
    about = "One-shot update of every configured symbol and interval"
)]
struct Args {
    /// Env file to load before reading configuration.
    #[arg(long = "env")]
    env_file: Option<PathBuf>,

    /// Restrict the run to these symbols (repeatable).
    #[arg(long = "symbol")]
    symbols: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    load_env_file(args.env_file.as_deref())?;
    let config = AppConfig::from_env()?;

    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg, LogBuffer::new(config.log_max_records))?;

    let symbols = if args.symbols.is_empty() {
        config.symbols.clone()
    } else {
        args.symbols
    };

    let normalizer = TimeNormalizer::resolve(&config.timezone, config.timezone_offset_hours)?;
    let store = Arc::new(SqliteKlineStore::open(&config.db_path)?);
    init_all_tables(store.as_ref(), &symbols, &config.intervals)?;

    let feed = Arc::new(BinanceFeed::new(config.feed_config())?);
    let state = Arc::new(EngineState::new(config.use_proxy));
    check_connectivity(feed.as_ref(), &state, &config.test_symbol);
    let engine = UpdateEngine::new(feed, store, state, normalizer);

    let normalizer = engine.normalizer();
    println!(
        "Backfill start | db={} symbols={} intervals={} route={} tz={} local_now={}",
        config.db_path.display(),
        symbols.len(),
        config.intervals.len(),
        engine.state().route().as_str(),
        normalizer.zone_name(),
        normalizer.to_wall_clock(&normalizer.now_local(engine.now()))
    );

    let mut total = 0;
    for symbol in &symbols {
        let report = engine.update_symbol_data(symbol, &config.intervals);
        for (interval, written) in &report {
            println!("{symbol:<12} {:<4} written={written}", interval.as_str());
            total += written;
        }
    }

    println!("Backfill done | written={total}");
    Ok(())
}
