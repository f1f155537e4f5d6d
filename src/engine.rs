//! Incremental update engine.
//!
//! For one (symbol, interval) pair a pass does the following:
//! - claims the pair so overlapping triggers coalesce
//! - reads the newest stored bar (or the interval's history anchor)
//! - fetches either one page or a paginated backfill up to `now`
//! - upserts every well-formed row and records the pass in `EngineState`

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::feed::{FetchError, KlineFeed, PageRequest, RawBar, RawRow, Route};
use crate::interval::{Interval, ALL_INTERVALS};
use crate::store::{KlineRecord, KlineStore, StoreError};
use crate::timezone::{TimeError, TimeNormalizer};

pub const WIDENED_FREQUENCY_SECS: u64 = 600;

/// Records written per interval for one `update_symbol_data` call.
pub type UpdateReport = BTreeMap<Interval, usize>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for deterministic runs.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock should not be poisoned") = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock should not be poisoned");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock should not be poisoned")
    }
}

#[derive(Debug, Default)]
struct Bookkeeping {
    last_update: HashMap<String, HashMap<Interval, DateTime<Utc>>>,
    last_probe: Option<DateTime<Utc>>,
    frequencies: HashMap<Interval, u64>,
    in_flight: HashSet<(String, Interval)>,
}

/// Process-wide mutable state shared by the engine, scheduler and HTTP layer.
#[derive(Debug)]
pub struct EngineState {
    inner: Mutex<Bookkeeping>,
    use_proxy: AtomicBool,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new(false)
    }
}

impl EngineState {
    pub fn new(use_proxy: bool) -> Self {
        let frequencies = ALL_INTERVALS
            .iter()
            .map(|interval| (*interval, interval.base_update_frequency_secs()))
            .collect();
        Self {
            inner: Mutex::new(Bookkeeping {
                frequencies,
                ..Bookkeeping::default()
            }),
            use_proxy: AtomicBool::new(use_proxy),
        }
    }

    pub fn set_use_proxy(&self, use_proxy: bool) {
        self.use_proxy.store(use_proxy, Ordering::SeqCst);
    }

    pub fn use_proxy(&self) -> bool {
        self.use_proxy.load(Ordering::SeqCst)
    }

    pub fn route(&self) -> Route {
        Route::from_use_proxy(self.use_proxy())
    }

    pub fn frequency_secs(&self, interval: Interval) -> u64 {
        let inner = self.lock();
        frequency_of(&inner, interval)
    }

    pub fn widen_frequency(&self, interval: Interval, secs: u64) {
        self.lock().frequencies.insert(interval, secs);
    }

    /// True when `last` is unknown or at least the current frequency has
    /// elapsed since it, in whole seconds.
    pub fn should_update(
        &self,
        interval: Interval,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        is_due(self.frequency_secs(interval), last, now)
    }

    pub fn last_update(&self, symbol: &str, interval: Interval) -> Option<DateTime<Utc>> {
        self.lock()
            .last_update
            .get(&pair_key(symbol))
            .and_then(|per_interval| per_interval.get(&interval))
            .copied()
    }

    pub fn record_update(&self, symbol: &str, interval: Interval, at: DateTime<Utc>) {
        self.lock()
            .last_update
            .entry(pair_key(symbol))
            .or_default()
            .insert(interval, at);
    }

    /// Due subset of `intervals` for every symbol, computed under one lock.
    /// Symbols with nothing due are omitted.
    pub fn due_subsets(
        &self,
        symbols: &[String],
        intervals: &[Interval],
        now: DateTime<Utc>,
    ) -> Vec<(String, Vec<Interval>)> {
        let inner = self.lock();
        symbols
            .iter()
            .filter_map(|symbol| {
                let last = inner.last_update.get(&pair_key(symbol));
                let due: Vec<Interval> = intervals
                    .iter()
                    .copied()
                    .filter(|interval| {
                        let last = last.and_then(|m| m.get(interval)).copied();
                        is_due(frequency_of(&inner, *interval), last, now)
                    })
                    .collect();
                (!due.is_empty()).then(|| (symbol.clone(), due))
            })
            .collect()
    }

    /// Marks (symbol, interval) as in flight. `None` when another pass
    /// already holds it.
    pub fn try_claim(&self, symbol: &str, interval: Interval) -> Option<InFlightGuard<'_>> {
        let key = (pair_key(symbol), interval);
        if !self.lock().in_flight.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard { state: self, key })
    }

    pub fn is_in_flight(&self, symbol: &str, interval: Interval) -> bool {
        self.lock()
            .in_flight
            .contains(&(pair_key(symbol), interval))
    }

    pub fn last_probe(&self) -> Option<DateTime<Utc>> {
        self.lock().last_probe
    }

    pub fn record_probe(&self, at: DateTime<Utc>) {
        self.lock().last_probe = Some(at);
    }

    /// Claims the probe slot when no probe has run yet or more than `period`
    /// has passed since the last one. The claim is the recorded time itself.
    pub fn claim_probe_if_due(&self, now: DateTime<Utc>, period: chrono::Duration) -> bool {
        let mut inner = self.lock();
        let due = match inner.last_probe {
            None => true,
            Some(last) => now - last > period,
        };
        if due {
            inner.last_probe = Some(now);
        }
        due
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bookkeeping> {
        self.inner
            .lock()
            .expect("engine state lock should not be poisoned")
    }
}

/// Symbols that map to the same table share bookkeeping and claims.
fn pair_key(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

fn frequency_of(inner: &Bookkeeping, interval: Interval) -> u64 {
    inner
        .frequencies
        .get(&interval)
        .copied()
        .unwrap_or_else(|| interval.base_update_frequency_secs())
}

fn is_due(frequency_secs: u64, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(last) => (now - last).num_seconds() >= frequency_secs as i64,
    }
}

/// Releases the in-flight claim on drop.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    state: &'a EngineState,
    key: (String, Interval),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().in_flight.remove(&self.key);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub page_limit: u32,
    pub page_delay: Duration,
    pub widened_frequency_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_limit: crate::feed::UPSTREAM_PAGE_LIMIT,
            page_delay: Duration::from_millis(100),
            widened_frequency_secs: WIDENED_FREQUENCY_SECS,
        }
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("time conversion error: {0}")]
    Time(#[from] TimeError),
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
}

pub struct UpdateEngine {
    feed: Arc<dyn KlineFeed>,
    store: Arc<dyn KlineStore>,
    state: Arc<EngineState>,
    normalizer: TimeNormalizer,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl UpdateEngine {
    pub fn new(
        feed: Arc<dyn KlineFeed>,
        store: Arc<dyn KlineStore>,
        state: Arc<EngineState>,
        normalizer: TimeNormalizer,
    ) -> Self {
        Self {
            feed,
            store,
            state,
            normalizer,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn feed(&self) -> &Arc<dyn KlineFeed> {
        &self.feed
    }

    pub fn store(&self) -> &Arc<dyn KlineStore> {
        &self.store
    }

    pub fn normalizer(&self) -> &TimeNormalizer {
        &self.normalizer
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Runs one pass per interval, in order, without a due check. A failing
    /// interval reports 0 and does not stop the rest.
    pub fn update_symbol_data(&self, symbol: &str, intervals: &[Interval]) -> UpdateReport {
        let mut report = UpdateReport::new();
        for interval in intervals {
            let written = match self.update_interval(symbol, *interval) {
                Ok(written) => written,
                Err(err) => {
                    warn!(
                        component = "engine",
                        event = "engine.interval.failed",
                        symbol,
                        interval = %interval,
                        error = %err
                    );
                    0
                }
            };
            report.insert(*interval, written);
        }

        info!(
            component = "engine",
            event = "engine.update.finished",
            symbol,
            intervals = intervals.len(),
            written = report.values().sum::<usize>()
        );
        report
    }

    pub fn update_interval(&self, symbol: &str, interval: Interval) -> Result<usize, UpdateError> {
        let Some(_claim) = self.state.try_claim(symbol, interval) else {
            info!(
                component = "engine",
                event = "engine.update.coalesced",
                symbol,
                interval = %interval
            );
            return Ok(0);
        };

        self.store.ensure_table(symbol, interval)?;

        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let last_local = match self.store.latest(symbol, interval)? {
            Some(record) => self.normalizer.from_wall_clock(record.timestamp)?,
            None => self.normalizer.default_history_start(interval)?,
        };
        let last_ms = self.normalizer.to_utc_millis(&last_local);
        let needed_bars = (now_ms - last_ms).max(0) / interval.duration_ms();

        debug!(
            component = "engine",
            event = "engine.window.computed",
            symbol,
            interval = %interval,
            last_ms,
            now_ms,
            needed_bars
        );

        if needed_bars <= i64::from(self.config.page_limit) {
            self.fetch_single(symbol, interval, last_ms, now)
        } else {
            Ok(self.fetch_paginated(symbol, interval, last_ms, now))
        }
    }

    fn fetch_single(
        &self,
        symbol: &str,
        interval: Interval,
        last_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<usize, UpdateError> {
        let req = PageRequest {
            symbol: symbol.to_string(),
            interval,
            start_ms: last_ms,
            end_ms: 0,
            limit: self.config.page_limit,
        };
        let rows = self.feed.fetch_page(&req, self.state.route())?;
        self.state.record_update(symbol, interval, now);
        Ok(self.persist_rows(symbol, interval, &rows))
    }

    fn fetch_paginated(
        &self,
        symbol: &str,
        interval: Interval,
        last_ms: i64,
        now: DateTime<Utc>,
    ) -> usize {
        let now_ms = now.timestamp_millis();
        let step = i64::from(self.config.page_limit) * interval.duration_ms();
        let mut written = 0;
        let mut pages = 0_usize;
        let mut start = last_ms;

        info!(
            component = "engine",
            event = "engine.backfill.start",
            symbol,
            interval = %interval,
            start_ms = last_ms,
            now_ms
        );

        while start < now_ms {
            if pages > 0 && !self.config.page_delay.is_zero() {
                thread::sleep(self.config.page_delay);
            }
            pages += 1;

            let req = PageRequest {
                symbol: symbol.to_string(),
                interval,
                start_ms: start,
                end_ms: (start + step).min(now_ms),
                limit: self.config.page_limit,
            };
            match self.feed.fetch_page(&req, self.state.route()) {
                Ok(rows) => {
                    self.state.record_update(symbol, interval, now);
                    written += self.persist_rows(symbol, interval, &rows);
                }
                Err(err) => warn!(
                    component = "engine",
                    event = "engine.page.failed",
                    symbol,
                    interval = %interval,
                    start_ms = req.start_ms,
                    end_ms = req.end_ms,
                    error = %err
                ),
            }
            start += step;
        }

        self.state
            .widen_frequency(interval, self.config.widened_frequency_secs);
        info!(
            component = "engine",
            event = "engine.frequency.widened",
            symbol,
            interval = %interval,
            pages,
            written,
            frequency_secs = self.config.widened_frequency_secs
        );
        written
    }

    fn persist_rows(&self, symbol: &str, interval: Interval, rows: &[RawRow]) -> usize {
        let mut written = 0;
        for row in rows {
            let bar = match RawBar::from_row(row) {
                Ok(bar) => bar,
                Err(err) => {
                    warn!(
                        component = "engine",
                        event = "engine.bar.malformed",
                        symbol,
                        interval = %interval,
                        error = %err
                    );
                    continue;
                }
            };

            let local = match self.normalizer.to_local(bar.open_time_ms) {
                Ok(local) => local,
                Err(err) => {
                    warn!(
                        component = "engine",
                        event = "engine.bar.malformed",
                        symbol,
                        interval = %interval,
                        error = %err
                    );
                    continue;
                }
            };

            let record = KlineRecord {
                timestamp: self.normalizer.to_wall_clock(&local),
                open_price: bar.open,
                close_price: bar.close,
                high_price: bar.high,
                low_price: bar.low,
                volume: bar.volume,
                note: None,
            };
            match self.store.upsert(symbol, interval, &record) {
                Ok(()) => written += 1,
                Err(err) => warn!(
                    component = "engine",
                    event = "engine.bar.upsert_failed",
                    symbol,
                    interval = %interval,
                    timestamp = %record.timestamp,
                    error = %err
                ),
            }
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn due_check_uses_whole_seconds_against_frequency() {
        let state = EngineState::default();
        assert!(state.should_update(Interval::M5, None, t(0)));
        assert!(!state.should_update(Interval::M5, Some(t(0)), t(299)));
        assert!(state.should_update(Interval::M5, Some(t(0)), t(300)));
    }

    #[test]
    fn widened_frequency_applies_to_later_due_checks() {
        let state = EngineState::default();
        assert_eq!(state.frequency_secs(Interval::M5), 300);
        state.widen_frequency(Interval::M5, WIDENED_FREQUENCY_SECS);
        assert!(!state.should_update(Interval::M5, Some(t(0)), t(300)));
        assert!(state.should_update(Interval::M5, Some(t(0)), t(600)));
        assert_eq!(state.frequency_secs(Interval::H1), 3_600);
    }

    #[test]
    fn claim_is_exclusive_until_guard_drops() {
        let state = EngineState::default();
        let guard = state.try_claim("BTCUSDT", Interval::H1).unwrap();
        assert!(state.try_claim("BTCUSDT", Interval::H1).is_none());
        assert!(state.try_claim("BTCUSDT", Interval::H4).is_some());
        assert!(state.is_in_flight("BTCUSDT", Interval::H1));
        drop(guard);
        assert!(!state.is_in_flight("BTCUSDT", Interval::H1));
        assert!(state.try_claim("BTCUSDT", Interval::H1).is_some());
    }

    #[test]
    fn symbol_case_and_padding_share_one_pair() {
        let state = EngineState::default();
        let _guard = state.try_claim("BTCUSDT", Interval::H1).unwrap();
        assert!(state.try_claim(" btcusdt", Interval::H1).is_none());
        assert!(state.is_in_flight("BtcUsdt", Interval::H1));

        state.record_update("ethusdt", Interval::M5, t(0));
        assert_eq!(state.last_update("ETHUSDT", Interval::M5), Some(t(0)));
        let plan = state.due_subsets(&["ETHUSDT".to_string()], &[Interval::M5], t(10));
        assert!(plan.is_empty());
    }

    #[test]
    fn probe_claim_fires_first_time_then_after_period() {
        let state = EngineState::default();
        let period = chrono::Duration::minutes(10);
        assert!(state.claim_probe_if_due(t(0), period));
        assert!(!state.claim_probe_if_due(t(600), period));
        assert!(state.claim_probe_if_due(t(601), period));
        assert_eq!(state.last_probe(), Some(t(601)));
    }

    #[test]
    fn due_subsets_skip_fresh_pairs() {
        let state = EngineState::default();
        state.record_update("BTCUSDT", Interval::M5, t(0));
        state.record_update("ETHUSDT", Interval::M5, t(0));
        state.record_update("ETHUSDT", Interval::H1, t(0));

        let plan = state.due_subsets(
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            &[Interval::M5, Interval::H1],
            t(120),
        );
        assert_eq!(plan, vec![("BTCUSDT".to_string(), vec![Interval::H1])]);
    }

    #[test]
    fn proxy_flag_drives_route() {
        let state = EngineState::new(true);
        assert_eq!(state.route(), Route::Proxy);
        state.set_use_proxy(false);
        assert_eq!(state.route(), Route::Direct);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(t(0));
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), t(30));
        clock.set(t(5));
        assert_eq!(clock.now(), t(5));
    }
}
