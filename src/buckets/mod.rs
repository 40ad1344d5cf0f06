//! Windowed bucket store.
//!
//! Events are aggregated in two steps. On ingest, every event lands in the
//! bucket covering its timestamp (`floor(ts / bucket_duration)`). On read,
//! the buckets of a time window are folded into a fresh accumulator. Stored
//! buckets are never mutated by a reduction, so a reduction can run while
//! the writer keeps filling the newest bucket.
//!
//! Buckets are kept newest-first in a concurrent skip list, so creating a
//! bucket never waits on a reduction walking the map. Eviction drops whole
//! buckets that fell out of the oldest watched window and closes them.

use std::cmp::Reverse;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use crossbeam_skiplist::SkipMap;
use thiserror::Error;

use crate::reader::event::Timestamped;

/// An aggregate stored in a bucket.
///
/// Implementations must be safe for one writer calling `accept` while other
/// threads read them through the reducer.
pub trait Aggregate<T>: Send + Sync {
    /// Accumulates one item.
    fn accept(&self, item: &T);

    /// Releases the aggregate's content once its bucket is evicted.
    fn close(&self) {}
}

/// Creates an empty aggregate, used for new buckets and as reduction identity.
pub type Factory<A> = Box<dyn Fn() -> A + Send + Sync>;

/// Folds a stored bucket (second argument) into an accumulator.
pub type Reducer<A> = Box<dyn Fn(&mut A, &A) + Send + Sync>;

/// Argument errors of multi-window reductions.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BucketsError {
    #[error("at least one duration is required")]
    NoDurations,

    #[error("durations must be sorted in ascending order")]
    UnsortedDurations,
}

/// Time-bucketed aggregates of `T` items.
pub struct TimeBuckets<T, A> {
    bucket_millis: i64,
    factory: Factory<A>,
    reducer: Reducer<A>,
    buckets: SkipMap<Reverse<i64>, Arc<A>>,
    _item: PhantomData<fn(&T)>,
}

impl<T, A> std::fmt::Debug for TimeBuckets<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeBuckets")
            .field("bucket_millis", &self.bucket_millis)
            .field("bucket_count", &self.buckets.len())
            .finish()
    }
}

impl<T: Timestamped, A: Aggregate<T> + 'static> TimeBuckets<T, A> {
    /// Creates an empty store. Fails when `bucket_duration` is under 1ms.
    pub fn new<F, R>(bucket_duration: Duration, factory: F, reducer: R) -> Result<Self>
    where
        F: Fn() -> A + Send + Sync + 'static,
        R: Fn(&mut A, &A) + Send + Sync + 'static,
    {
        let bucket_millis = millis_of(bucket_duration);
        if bucket_millis < 1 {
            bail!("bucket duration must be at least 1ms, got {bucket_duration:?}");
        }

        Ok(Self {
            bucket_millis,
            factory: Box::new(factory),
            reducer: Box::new(reducer),
            buckets: SkipMap::new(),
            _item: PhantomData,
        })
    }

    /// Bucket width in milliseconds.
    pub fn bucket_millis(&self) -> i64 {
        self.bucket_millis
    }

    /// Key of the bucket covering `timestamp_millis`.
    #[inline]
    pub fn key_of(&self, timestamp_millis: i64) -> i64 {
        timestamp_millis.div_euclid(self.bucket_millis)
    }

    /// Adds an item to the bucket covering its timestamp.
    pub fn accept(&self, item: &T) {
        let key = Reverse(self.key_of(item.timestamp_millis()));

        // Fast path: the bucket usually exists already.
        if let Some(entry) = self.buckets.get(&key) {
            entry.value().accept(item);
            return;
        }

        self.buckets
            .get_or_insert_with(key, || Arc::new((self.factory)()))
            .value()
            .accept(item);
    }

    /// Folds the buckets from `until_millis - duration` up to `until_millis`
    /// (both bucket keys included). Buckets newer than `until_millis` are
    /// ignored.
    pub fn reduce_latest(&self, until_millis: i64, duration: Duration) -> A {
        let until_key = self.key_of(until_millis);
        let since_key = self.key_of(until_millis.saturating_sub(millis_of(duration)));

        let mut acc = (self.factory)();
        for bucket in self.window(until_key, since_key) {
            (self.reducer)(&mut acc, &bucket.1);
        }
        acc
    }

    /// Reduces one window per duration in a single pass over the buckets,
    /// then evicts every bucket older than the greatest window.
    ///
    /// `durations` must be non-empty and sorted ascending. Results are in the
    /// same order as `durations`.
    pub fn reduce_latest_and_clean(
        &self,
        until_millis: i64,
        durations: &[Duration],
    ) -> Result<Vec<A>, BucketsError> {
        if durations.is_empty() {
            return Err(BucketsError::NoDurations);
        }
        if durations.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(BucketsError::UnsortedDurations);
        }

        let until_key = self.key_of(until_millis);
        let since_keys: Vec<i64> = durations
            .iter()
            .map(|d| self.key_of(until_millis.saturating_sub(millis_of(*d))))
            .collect();
        let oldest_key = since_keys[since_keys.len() - 1];

        let mut results: Vec<A> = durations.iter().map(|_| (self.factory)()).collect();
        for (key, bucket) in self.window(until_key, oldest_key) {
            // Since keys decrease as durations grow.
            for (acc, since_key) in results.iter_mut().zip(&since_keys) {
                if key >= *since_key {
                    (self.reducer)(acc, &bucket);
                }
            }
        }

        self.evict_before(oldest_key);

        Ok(results)
    }

    /// Evicts every bucket older than the window `[until - duration, until]`.
    /// Returns the number of evicted buckets.
    pub fn clean_up_oldest(&self, until_millis: i64, duration: Duration) -> usize {
        let key_limit = self.key_of(until_millis.saturating_sub(millis_of(duration)));
        self.evict_before(key_limit)
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Snapshot of the buckets with `since_key <= key <= until_key`, newest
    /// first. Bucket handles are cloned so folding never holds a map entry.
    fn window(&self, until_key: i64, since_key: i64) -> Vec<(i64, Arc<A>)> {
        if since_key > until_key {
            return Vec::new();
        }

        self.buckets
            .range(Reverse(until_key)..=Reverse(since_key))
            .map(|entry| (entry.key().0, Arc::clone(entry.value())))
            .collect()
    }

    fn evict_before(&self, key_limit: i64) -> usize {
        if key_limit == i64::MIN {
            return 0;
        }

        let mut evicted = 0;
        for entry in self.buckets.range(Reverse(key_limit - 1)..) {
            // A concurrent eviction may have taken the entry first.
            if entry.remove() {
                entry.value().close();
                evicted += 1;
            }
        }

        evicted
    }
}

/// Milliseconds of a duration, saturating at `i64::MAX`.
#[inline]
pub(crate) fn millis_of(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
