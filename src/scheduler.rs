//! Recurring tick that refreshes due pairs and re-probes connectivity.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::UpdateEngine;
use crate::feed::check_connectivity;
use crate::interval::Interval;

pub const DEFAULT_TICK_SECS: u64 = 60;
pub const PROBE_PERIOD_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
}

impl SchedulerState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub symbols: Vec<String>,
    pub intervals: Vec<Interval>,
    pub tick_period: Duration,
    pub probe_period: chrono::Duration,
    pub test_symbol: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            intervals: crate::interval::ALL_INTERVALS.to_vec(),
            tick_period: Duration::from_secs(DEFAULT_TICK_SECS),
            probe_period: chrono::Duration::seconds(PROBE_PERIOD_SECS),
            test_symbol: "BTCUSDT".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueUpdate {
    pub symbol: String,
    pub intervals: Vec<Interval>,
}

/// What one tick dispatched. Dropping the handles detaches the work.
#[derive(Debug, Default)]
pub struct TickReport {
    pub probe_started: bool,
    pub dispatched: Vec<DueUpdate>,
    pub handles: Vec<JoinHandle<()>>,
}

pub struct Scheduler {
    engine: Arc<UpdateEngine>,
    config: SchedulerConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(engine: Arc<UpdateEngine>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            config,
            task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SchedulerState {
        let task = self
            .task
            .lock()
            .expect("scheduler task lock should not be poisoned");
        match task.as_ref() {
            Some(handle) if !handle.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Starts the tick task. Returns the resulting state and whether it
    /// changed. Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> (SchedulerState, bool) {
        let mut task = self
            .task
            .lock()
            .expect("scheduler task lock should not be poisoned");
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return (SchedulerState::Running, false);
        }

        let scheduler = Arc::clone(self);
        let period = self.config.tick_period;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                scheduler.tick();
            }
        }));

        info!(
            component = "scheduler",
            event = "scheduler.started",
            tick_secs = period.as_secs(),
            symbols = self.config.symbols.len(),
            intervals = self.config.intervals.len()
        );
        (SchedulerState::Running, true)
    }

    /// Aborts the tick task. Updates already dispatched keep running.
    pub fn stop(&self) -> (SchedulerState, bool) {
        let handle = self
            .task
            .lock()
            .expect("scheduler task lock should not be poisoned")
            .take();
        match handle {
            Some(handle) => {
                handle.abort();
                info!(component = "scheduler", event = "scheduler.stopped");
                (SchedulerState::Stopped, true)
            }
            None => (SchedulerState::Stopped, false),
        }
    }

    pub fn plan_due_updates(&self, now: DateTime<Utc>) -> Vec<DueUpdate> {
        self.engine
            .state()
            .due_subsets(&self.config.symbols, &self.config.intervals, now)
            .into_iter()
            .map(|(symbol, intervals)| DueUpdate { symbol, intervals })
            .collect()
    }

    pub fn tick(&self) -> TickReport {
        let now = self.engine.now();
        let state = self.engine.state();
        let mut report = TickReport::default();

        if state.claim_probe_if_due(now, self.config.probe_period) {
            let feed = Arc::clone(self.engine.feed());
            let state = Arc::clone(state);
            let test_symbol = self.config.test_symbol.clone();
            report.probe_started = true;
            report.handles.push(tokio::task::spawn_blocking(move || {
                check_connectivity(feed.as_ref(), &state, &test_symbol);
            }));
        }

        report.dispatched = self.plan_due_updates(now);
        for due in &report.dispatched {
            let engine = Arc::clone(&self.engine);
            let due = due.clone();
            report.handles.push(tokio::task::spawn_blocking(move || {
                engine.update_symbol_data(&due.symbol, &due.intervals);
            }));
        }

        debug!(
            component = "scheduler",
            event = "scheduler.tick",
            probe_started = report.probe_started,
            dispatched = report.dispatched.len()
        );
        report
    }
}
