//! Periodic orchestration of reports and alert checks.
//!
//! Each tick reads the virtual clock, reports the overall statistic, reduces
//! every watched window in one pass over the buckets and feeds the results
//! to the statistic contexts and alert states of that duration.

pub mod report;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use self::report::{ReportHandler, StatisticContext, StatsReport};
use crate::alert::{AlertCheck, Transition};
use crate::buckets::millis_of;
use crate::clock::ReaderClock;
use crate::stat::{Statistic, StatisticBuckets};

/// Callback invoked on ticks happening before the first event.
pub type WaitingHandler = Box<dyn Fn() + Send + Sync>;

/// Callback invoked after every tick.
pub type TickHandler = Box<dyn Fn(&TickSummary) + Send + Sync>;

/// What a tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Virtual instant of the tick, `None` while waiting for input.
    pub at_millis: Option<i64>,
    pub alerts_raised: usize,
    pub alerts_released: usize,
    pub alerts_active: usize,
    /// Alert checks that failed during the tick.
    pub alert_errors: usize,
    pub bucket_count: usize,
    pub max_section_count_ever: usize,
    /// Wall-clock time spent in the tick.
    pub elapsed: Duration,
}

/// Drives statistic reports and alert checks from the reader clock.
pub struct Watcher {
    overall: Arc<dyn Statistic>,
    buckets: Arc<StatisticBuckets>,
    clock: ReaderClock,
    overall_context: Option<StatisticContext>,
    latest_contexts: HashMap<Duration, StatisticContext>,
    alert_states: Vec<Box<dyn AlertCheck>>,
    /// Every watched duration, sorted and deduplicated.
    durations: Vec<Duration>,
    waiting_handlers: Vec<WaitingHandler>,
    tick_handlers: Vec<TickHandler>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("durations", &self.durations)
            .field("latest_contexts", &self.latest_contexts.len())
            .field("alert_states", &self.alert_states.len())
            .finish()
    }
}

impl Watcher {
    pub fn new(
        overall: Arc<dyn Statistic>,
        buckets: Arc<StatisticBuckets>,
        clock: ReaderClock,
    ) -> Self {
        Self {
            overall,
            buckets,
            clock,
            overall_context: None,
            latest_contexts: HashMap::new(),
            alert_states: Vec::new(),
            durations: Vec::new(),
            waiting_handlers: Vec::new(),
            tick_handlers: Vec::new(),
        }
    }

    /// Reports the totals since the first event on every tick.
    pub fn set_overall_context(&mut self, context: StatisticContext) {
        self.overall_context = Some(context);
    }

    /// Reports the latest window of the context's duration on every tick.
    /// A context without duration replaces the overall context, and one
    /// whose duration is already watched replaces the previous context.
    pub fn add_latest_context(&mut self, context: StatisticContext) {
        match context.duration() {
            Some(duration) => {
                self.add_duration(duration);
                if self.latest_contexts.insert(duration, context).is_some() {
                    warn!(
                        duration = %humantime::format_duration(duration),
                        "replacing statistic context of an already watched window",
                    );
                }
            }
            None => self.overall_context = Some(context),
        }
    }

    /// Checks the alert state on every tick against its watched window.
    pub fn add_alert_state(&mut self, state: Box<dyn AlertCheck>) {
        self.add_duration(state.duration());
        self.alert_states.push(state);
    }

    pub fn on_waiting(&mut self, handler: WaitingHandler) {
        self.waiting_handlers.push(handler);
    }

    pub fn on_tick(&mut self, handler: TickHandler) {
        self.tick_handlers.push(handler);
    }

    pub fn durations(&self) -> &[Duration] {
        &self.durations
    }

    fn add_duration(&mut self, duration: Duration) {
        if let Err(pos) = self.durations.binary_search(&duration) {
            self.durations.insert(pos, duration);
        }
    }

    /// Runs one watch cycle.
    ///
    /// Alert checks that fail leave their state unchanged; the remaining
    /// checks still run and the first failure is returned.
    pub fn tick(&mut self) -> Result<TickSummary> {
        let started = Instant::now();
        let mut summary = TickSummary::default();

        let Some(at_millis) = self.clock.instant() else {
            for handler in &self.waiting_handlers {
                handler();
            }
            self.finish_tick(&mut summary, started);
            return Ok(summary);
        };
        summary.at_millis = Some(at_millis);

        if let Some(context) = &self.overall_context {
            context.notify(
                self.overall.as_ref(),
                self.clock.first_event_millis(),
                at_millis,
            );
        }

        let mut first_error = None;

        if !self.durations.is_empty() {
            let reduced = self
                .buckets
                .reduce_latest_and_clean(at_millis, &self.durations)
                .context("reducing watched windows")?;

            for (duration, statistic) in self.durations.iter().zip(&reduced) {
                let since_millis = at_millis.saturating_sub(millis_of(*duration));

                if let Some(context) = self.latest_contexts.get(duration) {
                    context.notify(statistic, Some(since_millis), at_millis);
                }

                for state in self
                    .alert_states
                    .iter_mut()
                    .filter(|s| s.duration() == *duration)
                {
                    match state.check(statistic, at_millis) {
                        Ok(Some(Transition::Raised)) => summary.alerts_raised += 1,
                        Ok(Some(Transition::Released)) => summary.alerts_released += 1,
                        Ok(None) => {}
                        Err(e) => {
                            summary.alert_errors += 1;
                            let e = e.context(format!(
                                "checking alert {} over {:?}",
                                state.id(),
                                duration
                            ));
                            first_error.get_or_insert(e);
                        }
                    }
                }
            }
        }

        self.finish_tick(&mut summary, started);

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn finish_tick(&self, summary: &mut TickSummary, started: Instant) {
        summary.elapsed = started.elapsed();
        summary.alerts_active = self.alert_states.iter().filter(|s| s.is_active()).count();
        summary.bucket_count = self.buckets.bucket_count();
        summary.max_section_count_ever = self.buckets.max_section_count_ever();

        for handler in &self.tick_handlers {
            handler(summary);
        }
    }

    /// Ticks every `period` until `cancel` fires. Tick failures are logged
    /// and the next tick proceeds.
    pub fn spawn(mut self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(
                period = ?period,
                durations = ?self.durations,
                alerts = self.alert_states.len(),
                "watcher started",
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("watcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick() {
                            let message = format!("{e:#}");
                            error!(error = %message, "watch cycle failed");
                        }
                    }
                }
            }
        })
    }
}
