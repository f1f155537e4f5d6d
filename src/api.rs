//! HTTP surface: kline reads, manual updates, network mode and scheduler
//! control, plus the buffered log views.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::UpdateEngine;
use crate::feed::{check_connectivity, Route};
use crate::interval::Interval;
use crate::observability::LogBuffer;
use crate::scheduler::Scheduler;
use crate::store::{clamp_limit, table_name, KlineQuery, StoreError, MAX_QUERY_LIMIT};

const DISPLAY_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidTableName(_) => Self::BadRequest(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

/// Upstream endpoints reported by `GET /api/v1/network`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub base_url: String,
    pub proxy_url: String,
    pub test_symbol: String,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<UpdateEngine>,
    pub scheduler: Arc<Scheduler>,
    pub logs: LogBuffer,
    pub network: NetworkInfo,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/logs", get(get_logs))
        .route("/logs/view", get(get_logs_view))
        .route("/api/v1/kline", get(get_klines))
        .route("/api/v1/update", post(post_update))
        .route("/api/v1/network", get(get_network).post(post_network))
        .route("/api/v1/network/test", post(post_network_test))
        .route("/api/v1/scheduler", get(get_scheduler))
        .route("/api/v1/scheduler/start", post(post_scheduler_start))
        .route("/api/v1/scheduler/stop", post(post_scheduler_stop))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(
            "Content-Type, Content-Length, Accept-Encoding, Authorization, Accept, Origin, Cache-Control, X-Requested-With",
        ),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
}

async fn get_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn get_logs(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "logs": state.logs.lines() }))
}

async fn get_logs_view(State(state): State<AppState>) -> impl IntoResponse {
    Html(render_logs_html(&state.logs.lines()))
}

#[derive(Debug, Default, Deserialize)]
struct KlineParams {
    symbol: Option<String>,
    interval: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Serialize)]
struct KlinePoint {
    timestamp: i64,
    datetime: String,
    open_price: String,
    close_price: String,
    high_price: String,
    low_price: String,
    volume: String,
    note: Option<String>,
}

async fn get_klines(
    State(state): State<AppState>,
    Query(params): Query<KlineParams>,
) -> Result<impl IntoResponse, ApiError> {
    let symbol = non_empty(params.symbol);
    let interval = non_empty(params.interval);
    let (Some(symbol), Some(interval_raw)) = (symbol, interval) else {
        return Err(ApiError::BadRequest(
            "missing required parameters: symbol, interval".to_string(),
        ));
    };
    let interval = interval_raw
        .parse::<Interval>()
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let limit = match non_empty(params.limit) {
        Some(raw) => clamp_limit(
            raw.parse::<i64>()
                .map_err(|_| ApiError::BadRequest("invalid limit parameter".to_string()))?,
        ),
        None => MAX_QUERY_LIMIT,
    };

    let normalizer = state.engine.normalizer();
    let to_wall_clock =
        |raw: Option<String>, name: &str| -> Result<Option<NaiveDateTime>, ApiError> {
            let Some(raw) = non_empty(raw) else {
                return Ok(None);
            };
            let invalid = || ApiError::BadRequest(format!("invalid {name} parameter"));
            let ms = raw.parse::<i64>().map_err(|_| invalid())?;
            let local = normalizer.to_local(ms).map_err(|_| invalid())?;
            Ok(Some(normalizer.to_wall_clock(&local)))
        };
    let query = KlineQuery {
        start: to_wall_clock(params.start_time, "start_time")?,
        end: to_wall_clock(params.end_time, "end_time")?,
        limit,
    };

    let records = state.engine.store().query(&symbol, interval, &query)?;
    let data = records
        .into_iter()
        .map(|record| {
            let local = normalizer
                .from_wall_clock(record.timestamp)
                .map_err(|err| ApiError::Internal(err.to_string()))?;
            Ok(KlinePoint {
                timestamp: normalizer.to_utc_millis(&local),
                datetime: record.timestamp.format(DISPLAY_DATETIME_FORMAT).to_string(),
                open_price: record.open_price,
                close_price: record.close_price,
                high_price: record.high_price,
                low_price: record.low_price,
                volume: record.volume,
                note: record.note,
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    info!(
        component = "api",
        event = "http.kline.request",
        symbol = %symbol,
        interval = %interval,
        count = data.len()
    );

    Ok(Json(json!({
        "symbol": symbol,
        "interval": interval,
        "count": data.len(),
        "data": data,
    })))
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    intervals: Vec<String>,
}

async fn post_update(
    State(state): State<AppState>,
    body: Result<Json<UpdateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::BadRequest("invalid request body".to_string()))?;
    let symbol = req.symbol.trim().to_string();
    if symbol.is_empty() {
        return Err(ApiError::BadRequest(
            "missing required parameter: symbol".to_string(),
        ));
    }
    if req.intervals.is_empty() {
        return Err(ApiError::BadRequest(
            "missing required parameter: intervals".to_string(),
        ));
    }
    let intervals = req
        .intervals
        .iter()
        .map(|raw| raw.parse::<Interval>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    for interval in &intervals {
        table_name(&symbol, *interval)?;
    }

    info!(
        component = "api",
        event = "http.update.triggered",
        symbol = %symbol,
        intervals = intervals.len()
    );

    let engine = Arc::clone(&state.engine);
    let dispatched = symbol.clone();
    tokio::task::spawn_blocking(move || {
        engine.update_symbol_data(&dispatched, &intervals);
    });

    Ok(Json(json!({
        "message": "update triggered",
        "symbol": symbol,
    })))
}

async fn get_network(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "use_proxy": state.engine.state().use_proxy(),
        "base_url": state.network.base_url,
        "proxy_url": state.network.proxy_url,
        "test_symbol": state.network.test_symbol,
    }))
}

#[derive(Debug, Deserialize)]
struct NetworkModeRequest {
    use_proxy: bool,
}

async fn post_network(
    State(state): State<AppState>,
    body: Result<Json<NetworkModeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::BadRequest("invalid request body".to_string()))?;
    state.engine.state().set_use_proxy(req.use_proxy);
    info!(
        component = "api",
        event = "network.mode.set",
        route = Route::from_use_proxy(req.use_proxy).as_str()
    );

    Ok(Json(json!({
        "message": "network mode updated",
        "use_proxy": req.use_proxy,
    })))
}

async fn post_network_test(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let feed = Arc::clone(state.engine.feed());
    let engine_state = Arc::clone(state.engine.state());
    let test_symbol = state.network.test_symbol.clone();
    let connected = tokio::task::spawn_blocking(move || {
        check_connectivity(feed.as_ref(), &engine_state, &test_symbol)
    })
    .await
    .map_err(|err| {
        warn!(component = "api", event = "network.test.join_failed", error = %err);
        ApiError::Internal(err.to_string())
    })?;

    let route = state.engine.state().route();
    Ok(Json(json!({
        "connected": connected,
        "use_proxy": route == Route::Proxy,
        "mode": route.as_str(),
    })))
}

async fn get_scheduler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "running": state.scheduler.status().is_running() }))
}

async fn post_scheduler_start(State(state): State<AppState>) -> impl IntoResponse {
    let (status, changed) = state.scheduler.start();
    let message = if changed {
        "scheduler started"
    } else {
        "scheduler already running"
    };
    Json(json!({ "message": message, "running": status.is_running() }))
}

async fn post_scheduler_stop(State(state): State<AppState>) -> impl IntoResponse {
    let (status, changed) = state.scheduler.stop();
    let message = if changed {
        "scheduler stopped"
    } else {
        "scheduler already stopped"
    };
    Json(json!({ "message": message, "running": status.is_running() }))
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Newest line first.
pub fn render_logs_html(lines: &[String]) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<meta http-equiv=\"refresh\" content=\"10\">\n");
    out.push_str("<title>Kline Sync Logs</title>\n");
    out.push_str("<style>body{margin:0;padding:20px;font-family:\"Segoe UI\",sans-serif;background:#f5f5f5}.shell{max-width:1200px;margin:0 auto;background:#fff;padding:20px;border-radius:6px;box-shadow:0 1px 3px rgba(0,0,0,.1)}h1{margin:0 0 12px;color:#333;border-bottom:1px solid #ddd;padding-bottom:10px}.logs{height:600px;overflow-y:auto;background:#f8f8f8;border:1px solid #ddd;border-radius:3px;padding:10px;font-family:monospace;white-space:pre-wrap}.log-entry{margin:4px 0;padding:4px;border-bottom:1px solid #eee}.info{color:#31708f}.warning{color:#8a6d3b}.error{color:#a94442;font-weight:bold}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");
    out.push_str(&format!(
        "<h1>Kline Sync Logs</h1><div>Lines: {}</div>\n",
        lines.len()
    ));
    out.push_str("<div class=\"logs\" id=\"logs\">\n");

    if lines.is_empty() {
        out.push_str("<div class=\"log-entry\">No log records yet</div>\n");
    }
    for line in lines.iter().rev() {
        out.push_str(&format!(
            "<div class=\"log-entry {}\">{}</div>\n",
            level_class(line),
            escape_html(line)
        ));
    }

    out.push_str("</div></main></body></html>\n");
    out
}

fn level_class(line: &str) -> &'static str {
    if line.contains("ERROR") {
        "error"
    } else if line.contains("WARN") {
        "warning"
    } else {
        "info"
    }
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
