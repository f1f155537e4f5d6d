//! Binance spot REST kline feed: page fetches, typed row decoding and the
//! connectivity probe that drives direct/proxy routing.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::EngineState;
use crate::interval::Interval;

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";
pub const UPSTREAM_PAGE_LIMIT: u32 = 1_000;
const KLINES_PATH: &str = "/api/v3/klines";
const TICKER_PRICE_PATH: &str = "/api/v3/ticker/price";
const MIN_ROW_FIELDS: usize = 6;

/// One upstream kline row before validation.
pub type RawRow = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxy,
}

impl Route {
    pub fn from_use_proxy(use_proxy: bool) -> Self {
        if use_proxy {
            Self::Proxy
        } else {
            Self::Direct
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Proxy => "proxy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub symbol: String,
    pub interval: Interval,
    /// Zero leaves the start unbounded.
    pub start_ms: i64,
    /// Zero leaves the end unbounded.
    pub end_ms: i64,
    /// Zero omits the limit and lets upstream apply its default.
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub base_url: String,
    pub proxy_url: String,
    pub test_symbol: String,
    pub page_timeout_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            proxy_url: String::new(),
            test_symbol: "BTCUSDT".to_string(),
            page_timeout_ms: 10_000,
            probe_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP client build error: {0}")]
    ClientBuild(String),
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("malformed response body from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("probe transport failure: {0}")]
    Transport(String),
    #[error("probe returned HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedBar {
    #[error("kline row is not an array")]
    NotAnArray,
    #[error("kline row has {found} fields, expected at least {expected}")]
    TooFewFields { found: usize, expected: usize },
    #[error("kline open time is not an integer: {0}")]
    InvalidOpenTime(String),
    #[error("kline field {field} is not a decimal string: {value}")]
    InvalidDecimal { field: &'static str, value: String },
}

/// A validated kline row. Price and volume fields keep the exact upstream
/// decimal text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBar {
    pub open_time_ms: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

impl RawBar {
    pub fn from_row(row: &RawRow) -> Result<Self, MalformedBar> {
        let fields = row.as_array().ok_or(MalformedBar::NotAnArray)?;
        if fields.len() < MIN_ROW_FIELDS {
            return Err(MalformedBar::TooFewFields {
                found: fields.len(),
                expected: MIN_ROW_FIELDS,
            });
        }

        let open_time_ms = fields[0]
            .as_i64()
            .ok_or_else(|| MalformedBar::InvalidOpenTime(fields[0].to_string()))?;

        Ok(Self {
            open_time_ms,
            open: decimal_field(&fields[1], "open")?,
            high: decimal_field(&fields[2], "high")?,
            low: decimal_field(&fields[3], "low")?,
            close: decimal_field(&fields[4], "close")?,
            volume: decimal_field(&fields[5], "volume")?,
        })
    }
}

fn decimal_field(value: &Value, field: &'static str) -> Result<String, MalformedBar> {
    match value.as_str() {
        Some(text) if is_decimal_text(text) => Ok(text.to_string()),
        _ => Err(MalformedBar::InvalidDecimal {
            field,
            value: value.to_string(),
        }),
    }
}

fn is_decimal_text(text: &str) -> bool {
    let unsigned = text.strip_prefix('-').unwrap_or(text);
    let (whole, frac) = match unsigned.split_once('.') {
        Some((whole, frac)) => (whole, Some(frac)),
        None => (unsigned, None),
    };
    let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());

    !whole.is_empty()
        && digits(whole)
        && frac.map(|f| !f.is_empty() && digits(f)).unwrap_or(true)
}

pub trait KlineFeed: Send + Sync {
    fn fetch_page(&self, req: &PageRequest, route: Route) -> Result<Vec<RawRow>, FetchError>;

    /// Lightweight single-symbol reachability check. Always goes direct.
    fn probe(&self, test_symbol: &str) -> Result<(), ConnectivityError>;
}

pub struct BinanceFeed {
    cfg: FeedConfig,
    page_client: reqwest::blocking::Client,
    probe_client: reqwest::blocking::Client,
}

impl BinanceFeed {
    pub fn new(cfg: FeedConfig) -> Result<Self, FetchError> {
        let page_client = build_client(cfg.page_timeout_ms)?;
        let probe_client = build_client(cfg.probe_timeout_ms)?;
        Ok(Self {
            cfg,
            page_client,
            probe_client,
        })
    }
}

fn build_client(timeout_ms: u64) -> Result<reqwest::blocking::Client, FetchError> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|err| FetchError::ClientBuild(err.to_string()))
}

impl KlineFeed for BinanceFeed {
    fn fetch_page(&self, req: &PageRequest, route: Route) -> Result<Vec<RawRow>, FetchError> {
        let url = routed_url(route, &self.cfg.proxy_url, &kline_url(&self.cfg.base_url, req));
        debug!(
            component = "feed",
            event = "feed.page.request",
            symbol = %req.symbol,
            interval = %req.interval,
            route = route.as_str(),
            url = %url
        );

        let response = self
            .page_client
            .get(&url)
            .send()
            .map_err(|err| FetchError::Transport {
                url: url.clone(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response.bytes().map_err(|err| FetchError::Transport {
            url: url.clone(),
            message: err.to_string(),
        })?;
        let rows = decode_page(&url, &body)?;

        info!(
            component = "feed",
            event = "feed.page.fetched",
            symbol = %req.symbol,
            interval = %req.interval,
            rows = rows.len()
        );
        Ok(rows)
    }

    fn probe(&self, test_symbol: &str) -> Result<(), ConnectivityError> {
        let url = format!(
            "{}{TICKER_PRICE_PATH}?symbol={test_symbol}",
            self.cfg.base_url.trim_end_matches('/')
        );
        let response = self
            .probe_client
            .get(&url)
            .send()
            .map_err(|err| ConnectivityError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectivityError::Status(status.as_u16()));
        }
        Ok(())
    }
}

pub fn kline_url(base_url: &str, req: &PageRequest) -> String {
    let mut url = format!(
        "{}{KLINES_PATH}?symbol={}&interval={}",
        base_url.trim_end_matches('/'),
        req.symbol,
        req.interval
    );
    if req.start_ms > 0 {
        url.push_str(&format!("&startTime={}", req.start_ms));
    }
    if req.end_ms > 0 {
        url.push_str(&format!("&endTime={}", req.end_ms));
    }
    if req.limit > 0 {
        url.push_str(&format!("&limit={}", req.limit));
    }
    url
}

/// The proxy is a URL prefix: the full upstream URL is appended to it.
pub fn routed_url(route: Route, proxy_url: &str, url: &str) -> String {
    match route {
        Route::Direct => url.to_string(),
        Route::Proxy => format!("{proxy_url}{url}"),
    }
}

pub fn decode_page(url: &str, body: &[u8]) -> Result<Vec<RawRow>, FetchError> {
    serde_json::from_slice::<Vec<RawRow>>(body).map_err(|err| FetchError::Decode {
        url: url.to_string(),
        message: err.to_string(),
    })
}

/// Probes upstream and flips the shared routing mode to match the outcome:
/// failure switches to the proxy, success switches back to direct.
pub fn check_connectivity(feed: &dyn KlineFeed, state: &EngineState, test_symbol: &str) -> bool {
    match feed.probe(test_symbol) {
        Ok(()) => {
            state.set_use_proxy(false);
            info!(
                component = "feed",
                event = "feed.connectivity.ok",
                test_symbol,
                route = Route::Direct.as_str()
            );
            true
        }
        Err(err) => {
            state.set_use_proxy(true);
            warn!(
                component = "feed",
                event = "feed.connectivity.failed",
                test_symbol,
                route = Route::Proxy.as_str(),
                error = %err
            );
            false
        }
    }
}
