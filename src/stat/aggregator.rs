use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::warn;

use super::{by_request_count, ScopedStats, SectionComparator, Statistic};
use crate::buckets::Aggregate;
use crate::reader::event::LogEvent;

/// Atomic request/weight counters of one scope.
#[derive(Default)]
struct ScopedCounter {
    request_count: AtomicU64,
    weight: AtomicU64,
}

impl ScopedCounter {
    #[inline]
    fn add(&self, stats: ScopedStats) {
        self.request_count
            .fetch_add(stats.request_count, Ordering::Relaxed);
        self.weight.fetch_add(stats.weight, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ScopedStats {
        ScopedStats {
            request_count: self.request_count.load(Ordering::Relaxed),
            weight: self.weight.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.request_count.store(0, Ordering::Relaxed);
        self.weight.store(0, Ordering::Relaxed);
    }
}

/// Remembers which overflowing sections were already reported.
///
/// The set of reported keys is bounded; once full, a single suppression
/// notice replaces further per-key reports.
struct OverflowLog {
    reported: parking_lot::Mutex<HashSet<String>>,
    limit: usize,
    suppressed: AtomicBool,
}

impl OverflowLog {
    fn new(limit: usize) -> Self {
        Self {
            reported: parking_lot::Mutex::new(HashSet::new()),
            limit,
            suppressed: AtomicBool::new(false),
        }
    }

    fn report(&self, section: &str, max_section_count: usize) {
        if self.suppressed.load(Ordering::Relaxed) {
            return;
        }

        let mut reported = self.reported.lock();
        if reported.contains(section) {
            return;
        }

        if reported.len() >= self.limit {
            if !self.suppressed.swap(true, Ordering::Relaxed) {
                warn!(
                    max_section_count,
                    reported = reported.len(),
                    "too many overflowing sections, suppressing further overflow diagnostics",
                );
            }
            return;
        }

        reported.insert(section.to_string());
        warn!(
            section,
            max_section_count, "section limit reached, section counted in overall only",
        );
    }
}

/// Thread-safe statistic accumulator of [`LogEvent`]s.
///
/// Overall counters are atomics. Sections live in a concurrent map whose
/// size never exceeds `max_section_count`; requests of sections that do not
/// fit only count in the overall totals.
pub struct StatisticAggregator {
    overall: ScopedCounter,
    sections: DashMap<String, ScopedCounter>,
    section_count: AtomicUsize,
    max_section_count: usize,
    comparator: SectionComparator,
    overflow: Option<OverflowLog>,
}

impl std::fmt::Debug for StatisticAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticAggregator")
            .field("overall", &self.overall.snapshot())
            .field("section_count", &self.section_count())
            .field("max_section_count", &self.max_section_count)
            .finish()
    }
}

impl StatisticAggregator {
    /// Creates an empty aggregator that silently counts overflowing
    /// sections in the overall totals.
    pub fn new(max_section_count: usize, comparator: SectionComparator) -> Self {
        Self {
            overall: ScopedCounter::default(),
            sections: DashMap::new(),
            section_count: AtomicUsize::new(0),
            max_section_count,
            comparator,
            overflow: None,
        }
    }

    /// Creates an empty aggregator that logs a warning the first time each
    /// section is turned away by the section limit.
    pub fn with_overflow_diagnostics(max_section_count: usize, comparator: SectionComparator) -> Self {
        Self {
            overflow: Some(OverflowLog::new(max_section_count.max(1))),
            ..Self::new(max_section_count, comparator)
        }
    }

    pub fn max_section_count(&self) -> usize {
        self.max_section_count
    }

    pub fn comparator(&self) -> SectionComparator {
        self.comparator
    }

    /// Adds one event. Invalid weights contribute zero weight.
    pub fn accept(&self, event: &LogEvent) {
        let stats = ScopedStats::new(1, event.weight_or_zero());
        self.overall.add(stats);

        if !self.add_to_section(&event.section, stats) {
            if let Some(overflow) = &self.overflow {
                overflow.report(&event.section, self.max_section_count);
            }
        }
    }

    /// Adds `stats` to `section`, creating it when the limit allows.
    /// Returns false when the section had to be skipped.
    fn add_to_section(&self, section: &str, stats: ScopedStats) -> bool {
        if let Some(counter) = self.sections.get(section) {
            counter.add(stats);
            return true;
        }

        match self.sections.entry(section.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                entry.get().add(stats);
                true
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let reserved = self
                    .section_count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                        (count < self.max_section_count).then_some(count + 1)
                    })
                    .is_ok();
                if reserved {
                    entry.insert(ScopedCounter::default()).add(stats);
                }
                reserved
            }
        }
    }
}

impl Default for StatisticAggregator {
    fn default() -> Self {
        Self::new(usize::MAX, by_request_count)
    }
}

impl Statistic for StatisticAggregator {
    fn overall(&self) -> ScopedStats {
        self.overall.snapshot()
    }

    fn top_sections(&self) -> Vec<(String, ScopedStats)> {
        let mut sections: Vec<(String, ScopedStats)> = self
            .sections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();

        let comparator = self.comparator;
        sections.sort_by(|a, b| comparator(&a.1, &b.1).then_with(|| a.0.cmp(&b.0)));
        sections
    }

    fn section_count(&self) -> usize {
        self.section_count.load(Ordering::Acquire)
    }

    fn for_each_section(&self, f: &mut dyn FnMut(&str, ScopedStats)) {
        for entry in self.sections.iter() {
            f(entry.key(), entry.value().snapshot());
        }
    }

    fn add(&self, other: &dyn Statistic) {
        self.overall.add(other.overall());
        other.for_each_section(&mut |section, stats| {
            self.add_to_section(section, stats);
        });
    }

    fn clear(&self) {
        self.sections.clear();
        self.section_count.store(0, Ordering::Release);
        self.overall.reset();
    }
}

impl Aggregate<LogEvent> for StatisticAggregator {
    fn accept(&self, event: &LogEvent) {
        StatisticAggregator::accept(self, event);
    }

    fn close(&self) {
        self.clear();
    }
}
