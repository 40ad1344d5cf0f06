//! Request statistics: overall and per-section counters.

pub mod aggregator;
pub mod buckets;

use std::cmp::Ordering;
use std::ops::{Add, AddAssign};

use serde::Serialize;

pub use aggregator::StatisticAggregator;
pub use buckets::StatisticBuckets;

/// Request count and accumulated weight of one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScopedStats {
    pub request_count: u64,
    pub weight: u64,
}

impl ScopedStats {
    pub const fn new(request_count: u64, weight: u64) -> Self {
        Self {
            request_count,
            weight,
        }
    }
}

impl Add for ScopedStats {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            request_count: self.request_count.saturating_add(other.request_count),
            weight: self.weight.saturating_add(other.weight),
        }
    }
}

impl AddAssign for ScopedStats {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

/// Orders two sections' statistics; `Less` sorts first.
pub type SectionComparator = fn(&ScopedStats, &ScopedStats) -> Ordering;

/// Most requested sections first.
pub fn by_request_count(a: &ScopedStats, b: &ScopedStats) -> Ordering {
    b.request_count.cmp(&a.request_count)
}

/// Read and merge capabilities shared by every statistic aggregate.
pub trait Statistic: Send + Sync {
    /// Totals over all requests, including those of untracked sections.
    fn overall(&self) -> ScopedStats;

    /// Every tracked section, sorted by the aggregate's comparator. Ties
    /// are ordered by section name.
    fn top_sections(&self) -> Vec<(String, ScopedStats)>;

    /// Number of tracked sections.
    fn section_count(&self) -> usize;

    /// Visits every tracked section in no particular order.
    fn for_each_section(&self, f: &mut dyn FnMut(&str, ScopedStats));

    /// Merges another aggregate into this one.
    fn add(&self, other: &dyn Statistic);

    /// Resets to the empty aggregate.
    fn clear(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_stats_add() {
        let mut a = ScopedStats::new(1, 10);
        a += ScopedStats::new(2, 5);

        assert_eq!(a, ScopedStats::new(3, 15));
        assert_eq!(
            ScopedStats::new(1, 2) + ScopedStats::new(3, 4),
            ScopedStats::new(3, 4) + ScopedStats::new(1, 2)
        );
        assert_eq!(ScopedStats::default() + a, a);
    }

    #[test]
    fn test_by_request_count_is_descending() {
        let mut stats = vec![
            ScopedStats::new(1, 0),
            ScopedStats::new(5, 0),
            ScopedStats::new(3, 0),
        ];
        stats.sort_by(by_request_count);

        let counts: Vec<u64> = stats.iter().map(|s| s.request_count).collect();
        assert_eq!(counts, vec![5, 3, 1]);
    }
}
