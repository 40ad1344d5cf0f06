use std::fmt::Display;

use chrono::FixedOffset;
use tracing::{info, warn};

use super::format_millis;
use crate::alert::AlertEvent;
use crate::watcher::StatsReport;

/// Renders statistics reports and alert transitions as log records.
#[derive(Debug, Clone, Copy)]
pub struct ReportLogger {
    zone: FixedOffset,
}

impl ReportLogger {
    pub fn new(zone: FixedOffset) -> Self {
        Self { zone }
    }

    pub fn report(&self, report: &StatsReport) {
        let top = report
            .top_sections
            .iter()
            .map(|(section, stats)| format!("/{section}={}", stats.request_count))
            .collect::<Vec<_>>()
            .join(" ");
        let since = report
            .since_millis
            .map(|ms| format_millis(ms, &self.zone))
            .unwrap_or_default();

        match report.duration {
            Some(duration) => info!(
                window = %humantime::format_duration(duration),
                at = %format_millis(report.at_millis, &self.zone),
                since = %since,
                requests = report.overall.request_count,
                bytes = report.overall.weight,
                rate = report.request_rate().unwrap_or_default(),
                sections = report.section_count,
                top = %top,
                "latest traffic",
            ),
            None => info!(
                at = %format_millis(report.at_millis, &self.zone),
                since = %since,
                requests = report.overall.request_count,
                bytes = report.overall.weight,
                sections = report.section_count,
                top = %top,
                "overall traffic",
            ),
        }
    }

    pub fn alert<M: Display>(&self, event: &AlertEvent<M>) {
        let since = format_millis(event.since_millis, &self.zone);

        match event.until_millis {
            None => warn!(
                alert = %event.config.id(),
                window = %humantime::format_duration(event.duration),
                value = %event.value_at_since,
                since = %since,
                "{} generated an alert",
                event.config.description(),
            ),
            Some(until) => info!(
                alert = %event.config.id(),
                window = %humantime::format_duration(event.duration),
                value = %event.value_at_since,
                since = %since,
                until = %format_millis(until, &self.zone),
                "{} alert recovered",
                event.config.description(),
            ),
        }
    }
}
