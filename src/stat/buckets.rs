use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::{SectionComparator, Statistic, StatisticAggregator};
use crate::buckets::{BucketsError, TimeBuckets};
use crate::reader::event::LogEvent;

/// Time buckets of [`StatisticAggregator`]s.
///
/// Every reduction records its section count in the shared
/// `max_section_count_ever` diagnostic.
pub struct StatisticBuckets {
    buckets: TimeBuckets<LogEvent, StatisticAggregator>,
    max_section_count_ever: Arc<AtomicUsize>,
}

impl std::fmt::Debug for StatisticBuckets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticBuckets")
            .field("buckets", &self.buckets)
            .field(
                "max_section_count_ever",
                &self.max_section_count_ever.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl StatisticBuckets {
    pub fn new(
        bucket_duration: Duration,
        max_section_count: usize,
        comparator: SectionComparator,
        max_section_count_ever: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let buckets = TimeBuckets::new(
            bucket_duration,
            move || StatisticAggregator::new(max_section_count, comparator),
            |acc: &mut StatisticAggregator, bucket: &StatisticAggregator| acc.add(bucket),
        )?;

        Ok(Self {
            buckets,
            max_section_count_ever,
        })
    }

    pub fn accept(&self, event: &LogEvent) {
        self.buckets.accept(event);
    }

    /// Statistics of the window of `duration` ending at `until_millis`.
    pub fn reduce_latest(&self, until_millis: i64, duration: Duration) -> StatisticAggregator {
        let reduced = self.buckets.reduce_latest(until_millis, duration);
        self.record_section_count(&reduced);
        reduced
    }

    /// Statistics of each window, evicting buckets older than the last one.
    pub fn reduce_latest_and_clean(
        &self,
        until_millis: i64,
        durations: &[Duration],
    ) -> Result<Vec<StatisticAggregator>, BucketsError> {
        let reduced = self.buckets.reduce_latest_and_clean(until_millis, durations)?;
        // The widest window holds the most sections.
        if let Some(widest) = reduced.last() {
            self.record_section_count(widest);
        }
        Ok(reduced)
    }

    pub fn clean_up_oldest(&self, until_millis: i64, duration: Duration) -> usize {
        self.buckets.clean_up_oldest(until_millis, duration)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.bucket_count()
    }

    pub fn max_section_count_ever(&self) -> usize {
        self.max_section_count_ever.load(Ordering::Relaxed)
    }

    fn record_section_count(&self, reduced: &StatisticAggregator) {
        self.max_section_count_ever
            .fetch_max(reduced.section_count(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::{by_request_count, ScopedStats};

    fn buckets(max_section_count: usize) -> StatisticBuckets {
        StatisticBuckets::new(
            Duration::from_millis(100),
            max_section_count,
            by_request_count,
            Arc::new(AtomicUsize::new(0)),
        )
        .expect("buckets")
    }

    #[test]
    fn test_reduce_matches_events_in_window() {
        let buckets = buckets(10);
        buckets.accept(&LogEvent::new(50, "old", Some(1)));
        buckets.accept(&LogEvent::new(1_000, "api", Some(10)));
        buckets.accept(&LogEvent::new(1_050, "api", Some(20)));
        buckets.accept(&LogEvent::new(1_150, "user", None));

        let reduced = buckets.reduce_latest(1_150, Duration::from_millis(200));

        assert_eq!(reduced.overall(), ScopedStats::new(3, 30));
        assert_eq!(
            reduced.top_sections(),
            vec![
                ("api".to_string(), ScopedStats::new(2, 30)),
                ("user".to_string(), ScopedStats::new(1, 0)),
            ]
        );
        assert_eq!(buckets.max_section_count_ever(), 2);
    }

    #[test]
    fn test_reduced_section_count_is_capped() {
        let buckets = buckets(2);
        // Each bucket tracks up to two sections, the reduction still caps at two.
        buckets.accept(&LogEvent::new(0, "a", Some(1)));
        buckets.accept(&LogEvent::new(0, "b", Some(1)));
        buckets.accept(&LogEvent::new(100, "c", Some(1)));
        buckets.accept(&LogEvent::new(100, "d", Some(1)));

        let reduced = buckets
            .reduce_latest_and_clean(100, &[Duration::from_millis(100)])
            .expect("reduce");

        assert_eq!(reduced[0].overall().request_count, 4);
        assert_eq!(reduced[0].section_count(), 2);
        assert_eq!(buckets.max_section_count_ever(), 2);
    }

    #[test]
    fn test_max_section_count_ever_only_grows() {
        let buckets = buckets(10);
        buckets.accept(&LogEvent::new(0, "a", Some(1)));
        buckets.accept(&LogEvent::new(0, "b", Some(1)));
        buckets.reduce_latest(0, Duration::from_millis(100));

        buckets.clean_up_oldest(10_000, Duration::from_millis(100));
        buckets.accept(&LogEvent::new(10_000, "c", Some(1)));
        let reduced = buckets.reduce_latest(10_000, Duration::from_millis(100));

        assert_eq!(reduced.section_count(), 1);
        assert_eq!(buckets.max_section_count_ever(), 2);
        assert_eq!(buckets.bucket_count(), 1);
    }
}
