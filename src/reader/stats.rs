use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters of the tail reader.
///
/// `snapshot()` atomically reads and resets all counters, so a periodic
/// reporter sees per-interval deltas.
#[derive(Debug, Default)]
pub struct ReaderStats {
    lines_read: AtomicU64,
    events: AtomicU64,
    lines_dropped: AtomicU64,
}

/// Counter values taken by [`ReaderStats::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStatsSnapshot {
    pub lines_read: u64,
    pub events: u64,
    pub lines_dropped: u64,
}

impl ReaderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_line(&self) {
        self.lines_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.lines_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> ReaderStatsSnapshot {
        ReaderStatsSnapshot {
            lines_read: self.lines_read.swap(0, Ordering::Relaxed),
            events: self.events.swap(0, Ordering::Relaxed),
            lines_dropped: self.lines_dropped.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_resets() {
        let stats = ReaderStats::new();
        stats.record_line();
        stats.record_line();
        stats.record_event();
        stats.record_dropped();

        assert_eq!(
            stats.snapshot(),
            ReaderStatsSnapshot {
                lines_read: 2,
                events: 1,
                lines_dropped: 1,
            }
        );
        assert_eq!(stats.snapshot(), ReaderStatsSnapshot::default());
    }
}
