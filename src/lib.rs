//! Kline sync core crate.
//!
//! Current implemented scope:
//! - UTC/local time normalization and the supported interval catalogue
//! - Binance kline feed with direct/proxy routing and a connectivity probe
//! - per-pair SQLite kline tables with idempotent upsert
//! - incremental update engine, recurring scheduler and HTTP API

mod api;
mod config;
mod engine;
mod feed;
mod interval;
mod observability;
mod scheduler;
mod store;
mod timezone;

pub use api::{render_logs_html, router, ApiError, AppState, NetworkInfo};
pub use config::{load_env_file, AppConfig, ConfigError};
pub use engine::{
    Clock, EngineConfig, EngineState, InFlightGuard, ManualClock, SystemClock, UpdateEngine,
    UpdateError, UpdateReport, WIDENED_FREQUENCY_SECS,
};
pub use feed::{
    check_connectivity, decode_page, kline_url, routed_url, BinanceFeed, ConnectivityError,
    FeedConfig, FetchError, KlineFeed, MalformedBar, PageRequest, RawBar, RawRow, Route,
    DEFAULT_BASE_URL, UPSTREAM_PAGE_LIMIT,
};
pub use interval::{Interval, UnsupportedInterval, ALL_INTERVALS};
pub use observability::{
    init_logging, log_app_bind, log_app_start, logging_config_from_env, LogBuffer,
    LogBufferWriter, LogFormat, LoggingConfig, LoggingInitError,
};
pub use scheduler::{
    DueUpdate, Scheduler, SchedulerConfig, SchedulerState, TickReport, DEFAULT_TICK_SECS,
    PROBE_PERIOD_SECS,
};
pub use store::{
    clamp_limit, init_all_tables, table_name, KlineQuery, KlineRecord, KlineStore,
    SqliteKlineStore, StoreError, MAX_QUERY_LIMIT,
};
pub use timezone::{LocalInstant, TimeError, TimeNormalizer};
