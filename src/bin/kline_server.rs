use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use kline_sync::{
    check_connectivity, init_all_tables, init_logging, load_env_file, log_app_bind, log_app_start,
    logging_config_from_env, router, AppConfig, AppState, BinanceFeed, EngineState, LogBuffer,
    NetworkInfo, Scheduler, SqliteKlineStore, TimeNormalizer, UpdateEngine,
};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "kline_server",
    about = "Keeps per-pair kline tables fresh and serves them over HTTP"
)]
struct Args {
    /// Env file to load before reading configuration. Defaults to
    /// config.env, then .env, when present.
    #[arg(long = "env")]
    env_file: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let env_file = load_env_file(args.env_file.as_deref())?;
    let config = AppConfig::from_env()?;

    let logging_cfg = logging_config_from_env();
    let logs = LogBuffer::new(config.log_max_records);
    init_logging(&logging_cfg, logs.clone())?;
    log_app_start(&logging_cfg);
    if let Some(path) = env_file {
        info!(component = "kline_server", event = "config.env_file", path = %path.display());
    }

    let normalizer = TimeNormalizer::resolve(&config.timezone, config.timezone_offset_hours)?;
    info!(
        component = "kline_server",
        event = "config.timezone",
        zone = %normalizer.zone_name()
    );
    let store = Arc::new(SqliteKlineStore::open(&config.db_path)?);
    init_all_tables(store.as_ref(), &config.symbols, &config.intervals)?;

    // The blocking HTTP client must be built and dropped outside the runtime.
    let feed = Arc::new(BinanceFeed::new(config.feed_config())?);
    let state = Arc::new(EngineState::new(config.use_proxy));
    state.record_probe(Utc::now());
    check_connectivity(feed.as_ref(), &state, &config.test_symbol);

    let engine = Arc::new(UpdateEngine::new(
        feed,
        store,
        Arc::clone(&state),
        normalizer,
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&engine),
        config.scheduler_config(),
    ));
    let app = router(AppState {
        engine: Arc::clone(&engine),
        scheduler: Arc::clone(&scheduler),
        logs,
        network: NetworkInfo {
            base_url: config.base_url.clone(),
            proxy_url: config.proxy_url.clone(),
            test_symbol: config.test_symbol.clone(),
        },
    });
    let addr = config.bind_addr()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        scheduler.start();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        log_app_bind(listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        scheduler.stop();
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    drop(runtime);
    drop(engine);
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(component = "kline_server", event = "app.shutdown");
    }
}
