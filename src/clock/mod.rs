use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use thiserror::Error;

use crate::buckets::millis_of;
use crate::reader::event::Timestamped;

/// Marker for "no event observed yet".
const UNSET: i64 = i64::MIN;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClockError {
    #[error("the reader clock zone is fixed at construction")]
    ZoneChangeUnsupported,
}

/// Tracks the first and the latest event timestamps seen by the reader.
///
/// Updated lock-free by the reader task, read by the watcher.
#[derive(Debug)]
pub struct LatestEvent {
    first: AtomicI64,
    latest: AtomicI64,
}

impl Default for LatestEvent {
    fn default() -> Self {
        Self {
            first: AtomicI64::new(UNSET),
            latest: AtomicI64::new(UNSET),
        }
    }
}

impl LatestEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event timestamp.
    pub fn observe(&self, event: &impl Timestamped) {
        let ts = event.timestamp_millis();
        // Only the first writer wins.
        let _ = self
            .first
            .compare_exchange(UNSET, ts, Ordering::AcqRel, Ordering::Acquire);
        self.latest.fetch_max(ts, Ordering::AcqRel);
    }

    /// Timestamp of the first observed event.
    pub fn first_millis(&self) -> Option<i64> {
        Some(self.first.load(Ordering::Acquire)).filter(|ts| *ts != UNSET)
    }

    /// Greatest observed timestamp.
    pub fn latest_millis(&self) -> Option<i64> {
        Some(self.latest.load(Ordering::Acquire)).filter(|ts| *ts != UNSET)
    }
}

/// Event-time clock driven by the timestamps read from the log.
///
/// Before any event is read the clock has no instant. Afterwards, each call
/// to [`ReaderClock::instant`] advances by at least `period`, and jumps
/// ahead whenever the log shows a later timestamp. This keeps the clock
/// moving while the log is idle and lets it catch up on bursts.
#[derive(Debug)]
pub struct ReaderClock {
    zone: FixedOffset,
    period_millis: i64,
    latest: Arc<LatestEvent>,
    last: Option<i64>,
}

impl ReaderClock {
    pub fn new(zone: FixedOffset, period: Duration, latest: Arc<LatestEvent>) -> Self {
        Self {
            zone,
            period_millis: millis_of(period),
            latest,
            last: None,
        }
    }

    pub fn zone(&self) -> FixedOffset {
        self.zone
    }

    /// Timestamp of the first event read, if any.
    pub fn first_event_millis(&self) -> Option<i64> {
        self.latest.first_millis()
    }

    /// The zone is part of the clock's identity and cannot change.
    pub fn with_zone(&self, _zone: FixedOffset) -> Result<Self, ClockError> {
        Err(ClockError::ZoneChangeUnsupported)
    }

    /// Current virtual instant in epoch milliseconds, `None` until the
    /// first event is read.
    pub fn instant(&mut self) -> Option<i64> {
        let latest = self.latest.latest_millis()?;

        let next = match self.last {
            None => latest,
            Some(last) => latest.max(last.saturating_add(self.period_millis)),
        };
        self.last = Some(next);

        Some(next)
    }
}
