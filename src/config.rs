//! Environment-driven runtime configuration.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::feed::{FeedConfig, DEFAULT_BASE_URL};
use crate::interval::Interval;
use crate::scheduler::{SchedulerConfig, DEFAULT_TICK_SECS};

const DEFAULT_ENV_FILES: [&str; 2] = ["config.env", ".env"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub api_addr: String,
    pub symbols: Vec<String>,
    pub intervals: Vec<Interval>,
    pub base_url: String,
    pub proxy_url: String,
    pub use_proxy: bool,
    pub test_symbol: String,
    pub timezone: String,
    pub timezone_offset_hours: i32,
    pub tick_secs: u64,
    pub log_max_records: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/klines.sqlite"),
            api_addr: "0.0.0.0:8080".to_string(),
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "BNBUSDT".to_string(),
            ],
            intervals: crate::interval::ALL_INTERVALS.to_vec(),
            base_url: DEFAULT_BASE_URL.to_string(),
            proxy_url: "https://your-proxy-url/".to_string(),
            use_proxy: false,
            test_symbol: "BTCUSDT".to_string(),
            timezone: "Asia/Shanghai".to_string(),
            timezone_offset_hours: 8,
            tick_secs: DEFAULT_TICK_SECS,
            log_max_records: 1_000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DB_PATH must not be empty")]
    EmptyDbPath,
    #[error("no symbols configured")]
    NoSymbols,
    #[error("no intervals configured")]
    NoIntervals,
    #[error("unsupported interval in BINANCE_INTERVALS: {0}")]
    UnsupportedInterval(String),
    #[error("invalid API_ADDR '{0}'")]
    InvalidBindAddr(String),
    #[error("failed to load env file {path}: {message}")]
    EnvFile { path: String, message: String },
}

/// Loads `explicit` when given, otherwise the first of `config.env` and
/// `.env` that exists. Variables already set in the process win.
pub fn load_env_file(explicit: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    let candidate = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => DEFAULT_ENV_FILES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()),
    };

    let Some(path) = candidate else {
        return Ok(None);
    };
    dotenvy::from_path(&path).map_err(|err| ConfigError::EnvFile {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    info!(
        component = "config",
        event = "config.env_file.loaded",
        path = %path.display()
    );
    Ok(Some(path))
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(db_path) = env_string("DB_PATH") {
            config.db_path = PathBuf::from(db_path);
        }
        if let Some(addr) = env_string("API_ADDR") {
            config.api_addr = addr;
        }
        if let Some(raw) = env_string("BINANCE_SYMBOLS") {
            config.symbols = parse_list(&raw);
        }
        if let Some(raw) = env_string("BINANCE_INTERVALS") {
            config.intervals = parse_intervals(&raw)?;
        }
        if let Some(base_url) = env_string("BINANCE_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(proxy_url) = env_string("BINANCE_PROXY_URL") {
            config.proxy_url = proxy_url;
        }
        if let Some(use_proxy) = env_string("BINANCE_USE_PROXY").and_then(|raw| parse_bool(&raw)) {
            config.use_proxy = use_proxy;
        }
        if let Some(test_symbol) = env_string("BINANCE_TEST_SYMBOL") {
            config.test_symbol = test_symbol;
        }
        if let Some(timezone) = env_string("TIMEZONE") {
            config.timezone = timezone;
        }
        if let Some(offset) = env_parsed("TIMEZONE_OFFSET") {
            config.timezone_offset_hours = offset;
        }
        if let Some(tick_secs) = env_parsed::<u64>("CRON_TICK_SECS").filter(|secs| *secs > 0) {
            config.tick_secs = tick_secs;
        }
        if let Some(max) = env_parsed::<usize>("LOG_MAX_RECORDS").filter(|max| *max > 0) {
            config.log_max_records = max;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDbPath);
        }
        if self.symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        if self.intervals.is_empty() {
            return Err(ConfigError::NoIntervals);
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.api_addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(self.api_addr.clone()))
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            base_url: self.base_url.clone(),
            proxy_url: self.proxy_url.clone(),
            test_symbol: self.test_symbol.clone(),
            ..FeedConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            symbols: self.symbols.clone(),
            intervals: self.intervals.clone(),
            tick_period: Duration::from_secs(self.tick_secs),
            test_symbol: self.test_symbol.clone(),
            ..SchedulerConfig::default()
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|raw| raw.parse().ok())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_intervals(raw: &str) -> Result<Vec<Interval>, ConfigError> {
    parse_list(raw)
        .iter()
        .map(|item| {
            item.parse::<Interval>()
                .map_err(|err| ConfigError::UnsupportedInterval(err.0))
        })
        .collect()
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
