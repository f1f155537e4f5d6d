use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use kline_sync::{
    router, AppState, ConnectivityError, EngineConfig, EngineState, FetchError, Interval,
    KlineFeed, KlineRecord, KlineStore, LogBuffer, ManualClock, NetworkInfo, PageRequest, RawRow,
    Route, Scheduler, SchedulerConfig, SqliteKlineStore, TimeNormalizer, UpdateEngine,
};
use serde_json::{json, Value};
use tower::util::ServiceExt;

/// 2020-01-01 00:00 Asia/Shanghai.
const SHANGHAI_2020_MS: i64 = 1_577_808_000_000;
const HOUR_MS: i64 = 3_600_000;

#[derive(Default)]
struct StubFeed {
    probe_fails: AtomicBool,
    requests: Mutex<Vec<PageRequest>>,
}

impl StubFeed {
    fn requests(&self) -> Vec<PageRequest> {
        self.requests
            .lock()
            .expect("request log lock should not be poisoned")
            .clone()
    }
}

impl KlineFeed for StubFeed {
    fn fetch_page(&self, req: &PageRequest, _route: Route) -> Result<Vec<RawRow>, FetchError> {
        self.requests
            .lock()
            .expect("request log lock should not be poisoned")
            .push(req.clone());
        Ok(Vec::new())
    }

    fn probe(&self, _test_symbol: &str) -> Result<(), ConnectivityError> {
        if self.probe_fails.load(Ordering::SeqCst) {
            Err(ConnectivityError::Status(451))
        } else {
            Ok(())
        }
    }
}

struct TestApp {
    app: Router,
    feed: Arc<StubFeed>,
    store: Arc<SqliteKlineStore>,
    state: Arc<EngineState>,
    logs: LogBuffer,
}

fn test_app() -> TestApp {
    let feed = Arc::new(StubFeed::default());
    let store = Arc::new(SqliteKlineStore::open_in_memory().expect("in-memory store should open"));
    let state = Arc::new(EngineState::default());
    let clock = Utc
        .timestamp_millis_opt(SHANGHAI_2020_MS + 3 * HOUR_MS)
        .single()
        .unwrap();
    let engine = Arc::new(
        UpdateEngine::new(
            feed.clone(),
            store.clone(),
            Arc::clone(&state),
            TimeNormalizer::resolve("Asia/Shanghai", 8).unwrap(),
        )
        .with_clock(Arc::new(ManualClock::new(clock)))
        .with_config(EngineConfig {
            page_delay: Duration::ZERO,
            ..EngineConfig::default()
        }),
    );
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&engine),
        SchedulerConfig {
            symbols: vec!["BTCUSDT".to_string()],
            intervals: vec![Interval::H4],
            tick_period: Duration::from_secs(3_600),
            ..SchedulerConfig::default()
        },
    ));
    let logs = LogBuffer::detached(100);

    let app = router(AppState {
        engine,
        scheduler,
        logs: logs.clone(),
        network: NetworkInfo {
            base_url: "https://api.binance.com".to_string(),
            proxy_url: "https://proxy.example/".to_string(),
            test_symbol: "BTCUSDT".to_string(),
        },
    });

    TestApp {
        app,
        feed,
        store,
        state,
        logs,
    }
}

fn local(hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, 1)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn seed(store: &SqliteKlineStore, hours: std::ops::Range<u32>) {
    store.ensure_table("BTCUSDT", Interval::H1).unwrap();
    for hour in hours {
        store
            .upsert(
                "BTCUSDT",
                Interval::H1,
                &KlineRecord {
                    timestamp: local(hour),
                    open_price: "7195.24000000".to_string(),
                    close_price: format!("{hour}.5"),
                    high_price: "7196.25000000".to_string(),
                    low_price: "7175.46000000".to_string(),
                    volume: "511.81416400".to_string(),
                    note: None,
                },
            )
            .unwrap();
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_carries_cors_headers_and_options_is_no_content() {
    let t = test_app();

    let response = t.app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/v1/update")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
}

#[tokio::test]
async fn kline_query_rejects_bad_parameters() {
    let t = test_app();

    for uri in [
        "/api/v1/kline?interval=1h",
        "/api/v1/kline?symbol=BTCUSDT",
        "/api/v1/kline?symbol=&interval=1h",
        "/api/v1/kline?symbol=BTCUSDT&interval=1d",
        "/api/v1/kline?symbol=BTCUSDT&interval=1h&limit=ten",
        "/api/v1/kline?symbol=BTCUSDT&interval=1h&start_time=yesterday",
        "/api/v1/kline?symbol=BTCUSDT&interval=1h&end_time=1.5",
        "/api/v1/kline?symbol=BTC-USDT&interval=1h",
        "/api/v1/kline?symbol=btc%3Busdt&interval=4h",
    ] {
        let (status, body) = send(&t.app, get(uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(body["error"].is_string(), "{uri}");
    }
}

#[tokio::test]
async fn kline_query_returns_newest_first_with_utc_and_local_times() {
    let t = test_app();
    seed(&t.store, 0..5);

    let uri = format!(
        "/api/v1/kline?symbol=BTCUSDT&interval=1h&start_time={}&end_time={}&limit=2",
        SHANGHAI_2020_MS + HOUR_MS,
        SHANGHAI_2020_MS + 3 * HOUR_MS
    );
    let (status, body) = send(&t.app, get(&uri)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["symbol"], "BTCUSDT");
    assert_eq!(body["interval"], "1h");
    assert_eq!(body["count"], 2);
    assert_eq!(body["data"][0]["timestamp"], SHANGHAI_2020_MS + 3 * HOUR_MS);
    assert_eq!(body["data"][0]["datetime"], "2020-01-01 03:00");
    assert_eq!(body["data"][0]["close_price"], "3.5");
    assert_eq!(body["data"][1]["datetime"], "2020-01-01 02:00");
    assert_eq!(body["data"][1]["volume"], "511.81416400");
    assert_eq!(body["data"][1]["note"], Value::Null);
}

#[tokio::test]
async fn kline_query_clamps_limit_and_reads_missing_table_as_empty() {
    let t = test_app();
    seed(&t.store, 0..5);

    let (status, body) = send(
        &t.app,
        get("/api/v1/kline?symbol=BTCUSDT&interval=1h&limit=0"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 5);

    let (status, body) = send(&t.app, get("/api/v1/kline?symbol=SOLUSDT&interval=4h")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn update_trigger_validates_request_body() {
    let t = test_app();

    for body in [
        "{not json",
        r#"{"symbol":"","intervals":["1h"]}"#,
        r#"{"symbol":"BTCUSDT","intervals":[]}"#,
        r#"{"symbol":"BTCUSDT"}"#,
        r#"{"symbol":"BTCUSDT","intervals":["1h","1w"]}"#,
        r#"{"symbol":"BTC-USDT","intervals":["1h"]}"#,
    ] {
        let (status, value) = send(&t.app, post_json("/api/v1/update", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert!(value["error"].is_string(), "{body}");
    }

    let (status, value) = send(
        &t.app,
        post_json(
            "/api/v1/update",
            r#"{"symbol":"BTCUSDT","intervals":["1h","4h"]}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["symbol"], "BTCUSDT");
    assert!(value["message"].is_string());

    let requests = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let requests = t.feed.requests();
            if requests.len() >= 2 {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dispatched update should reach the feed");
    let fetched: Vec<Interval> = requests.iter().map(|req| req.interval).collect();
    assert_eq!(fetched, vec![Interval::H1, Interval::H4]);
    assert!(requests.iter().all(|req| req.symbol == "BTCUSDT"));
}

#[tokio::test]
async fn network_mode_round_trips() {
    let t = test_app();

    let (status, body) = send(&t.app, get("/api/v1/network")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "use_proxy": false,
            "base_url": "https://api.binance.com",
            "proxy_url": "https://proxy.example/",
            "test_symbol": "BTCUSDT",
        })
    );

    let (status, body) = send(
        &t.app,
        post_json("/api/v1/network", r#"{"use_proxy":true}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["use_proxy"], true);
    assert!(t.state.use_proxy());

    let (_, body) = send(&t.app, get("/api/v1/network")).await;
    assert_eq!(body["use_proxy"], true);

    let (status, _) = send(&t.app, post_json("/api/v1/network", r#"{"mode":1}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn network_test_reports_probe_outcome_and_mode() {
    let t = test_app();

    t.feed.probe_fails.store(true, Ordering::SeqCst);
    let (status, body) = send(&t.app, post_json("/api/v1/network/test", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"connected": false, "use_proxy": true, "mode": "proxy"})
    );

    t.feed.probe_fails.store(false, Ordering::SeqCst);
    let (_, body) = send(&t.app, post_json("/api/v1/network/test", "")).await;
    assert_eq!(
        body,
        json!({"connected": true, "use_proxy": false, "mode": "direct"})
    );
}

#[tokio::test]
async fn scheduler_status_transitions_are_idempotent() {
    let t = test_app();

    let (_, body) = send(&t.app, get("/api/v1/scheduler")).await;
    assert_eq!(body, json!({"running": false}));

    let (_, body) = send(&t.app, post_json("/api/v1/scheduler/start", "")).await;
    assert_eq!(body["running"], true);
    assert_eq!(body["message"], "scheduler started");

    let (_, body) = send(&t.app, post_json("/api/v1/scheduler/start", "")).await;
    assert_eq!(body["running"], true);
    assert_eq!(body["message"], "scheduler already running");

    let (_, body) = send(&t.app, get("/api/v1/scheduler")).await;
    assert_eq!(body, json!({"running": true}));

    let (_, body) = send(&t.app, post_json("/api/v1/scheduler/stop", "")).await;
    assert_eq!(body["running"], false);
    assert_eq!(body["message"], "scheduler stopped");

    let (_, body) = send(&t.app, post_json("/api/v1/scheduler/stop", "")).await;
    assert_eq!(body["message"], "scheduler already stopped");
}

#[tokio::test]
async fn log_routes_expose_buffered_lines() {
    let t = test_app();
    t.logs.push("INFO engine.update.finished symbol=BTCUSDT");
    t.logs.push("WARN engine.bar.malformed");

    let (status, body) = send(&t.app, get("/logs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"logs": [
            "INFO engine.update.finished symbol=BTCUSDT",
            "WARN engine.bar.malformed"
        ]})
    );

    let response = t.app.clone().oneshot(get("/logs/view")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let html = String::from_utf8(body.to_vec()).unwrap();
    assert!(html.contains("class=\"log-entry warning\""));
    let malformed = html.find("engine.bar.malformed").unwrap();
    let finished = html.find("engine.update.finished").unwrap();
    assert!(malformed < finished);
}
