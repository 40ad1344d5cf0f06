use std::time::Duration;

use serde::Serialize;

use crate::stat::{ScopedStats, Statistic};

/// Snapshot of a statistic handed to report handlers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    /// Watched duration, `None` for the totals since the first event.
    #[serde(with = "humantime_serde")]
    pub duration: Option<Duration>,
    /// Start of the covered period in epoch milliseconds, when known.
    pub since_millis: Option<i64>,
    /// Virtual instant of the report in epoch milliseconds.
    pub at_millis: i64,
    pub overall: ScopedStats,
    /// Number of sections tracked by the statistic.
    pub section_count: usize,
    /// Busiest sections, at most the context's top section count.
    pub top_sections: Vec<(String, ScopedStats)>,
}

impl StatsReport {
    pub fn new(
        statistic: &dyn Statistic,
        duration: Option<Duration>,
        since_millis: Option<i64>,
        at_millis: i64,
        top_section_count: usize,
    ) -> Self {
        let mut top_sections = statistic.top_sections();
        top_sections.truncate(top_section_count);

        Self {
            duration,
            since_millis,
            at_millis,
            overall: statistic.overall(),
            section_count: statistic.section_count(),
            top_sections,
        }
    }

    /// Average requests per second over the watched duration.
    pub fn request_rate(&self) -> Option<f64> {
        let seconds = self.duration?.as_secs_f64();
        (seconds > 0.0).then(|| self.overall.request_count as f64 / seconds)
    }
}

/// Callback for statistics reports.
pub type ReportHandler = Box<dyn Fn(&StatsReport) + Send + Sync>;

/// Where and how often a statistic is reported.
pub struct StatisticContext {
    duration: Option<Duration>,
    top_section_count: usize,
    handler: ReportHandler,
}

impl std::fmt::Debug for StatisticContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticContext")
            .field("duration", &self.duration)
            .field("top_section_count", &self.top_section_count)
            .finish()
    }
}

impl StatisticContext {
    /// Context of the totals since the first event.
    pub fn overall(top_section_count: usize, handler: ReportHandler) -> Self {
        Self {
            duration: None,
            top_section_count,
            handler,
        }
    }

    /// Context of the window of `duration` ending at each tick.
    pub fn latest(duration: Duration, top_section_count: usize, handler: ReportHandler) -> Self {
        Self {
            duration: Some(duration),
            top_section_count,
            handler,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn top_section_count(&self) -> usize {
        self.top_section_count
    }

    pub(crate) fn notify(&self, statistic: &dyn Statistic, since_millis: Option<i64>, at_millis: i64) {
        let report = StatsReport::new(
            statistic,
            self.duration,
            since_millis,
            at_millis,
            self.top_section_count,
        );
        (self.handler)(&report);
    }
}
