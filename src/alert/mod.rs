//! Edge-triggered threshold alerts.
//!
//! An [`AlertConfig`] extracts a metric from a statistic and tests it with a
//! predicate. One [`AlertState`] per (config, watched duration) pair tracks
//! whether the alert is raised and notifies the config's listeners only when
//! the predicate flips.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::buckets::millis_of;
use crate::stat::Statistic;

/// Stable identity of an alert configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertId(String);

impl AlertId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the alert metric of a statistic covering the given duration.
pub type MetricExtractor<M> = Box<dyn Fn(&dyn Statistic, Duration) -> Result<M> + Send + Sync>;

/// Decides whether a metric value raises the alert.
pub type MetricPredicate<M> = Box<dyn Fn(&M) -> Result<bool> + Send + Sync>;

/// Receives every alert transition.
pub type AlertListener<M> = Box<dyn Fn(&AlertEvent<M>) + Send + Sync>;

/// Immutable alert definition, shared by all states watching it.
pub struct AlertConfig<M> {
    id: AlertId,
    description: String,
    extractor: MetricExtractor<M>,
    predicate: MetricPredicate<M>,
    listeners: Vec<AlertListener<M>>,
}

impl<M> fmt::Debug for AlertConfig<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertConfig")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<M> AlertConfig<M> {
    pub fn new<E, P>(
        id: AlertId,
        description: impl Into<String>,
        extractor: E,
        predicate: P,
    ) -> Self
    where
        E: Fn(&dyn Statistic, Duration) -> Result<M> + Send + Sync + 'static,
        P: Fn(&M) -> Result<bool> + Send + Sync + 'static,
    {
        Self {
            id,
            description: description.into(),
            extractor: Box::new(extractor),
            predicate: Box::new(predicate),
            listeners: Vec::with_capacity(2),
        }
    }

    /// Registers a listener called on every transition.
    pub fn on_alert<F>(mut self, listener: F) -> Self
    where
        F: Fn(&AlertEvent<M>) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
        self
    }

    pub fn id(&self) -> &AlertId {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// One alert transition.
///
/// `until_millis` is `None` while the alert is raised.
pub struct AlertEvent<M> {
    pub config: Arc<AlertConfig<M>>,
    pub duration: Duration,
    pub value_at_since: M,
    pub since_millis: i64,
    pub until_millis: Option<i64>,
}

impl<M> AlertEvent<M> {
    pub fn is_raised(&self) -> bool {
        self.until_millis.is_none()
    }
}

impl<M: fmt::Debug> fmt::Debug for AlertEvent<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertEvent")
            .field("id", &self.config.id)
            .field("duration", &self.duration)
            .field("value_at_since", &self.value_at_since)
            .field("since_millis", &self.since_millis)
            .field("until_millis", &self.until_millis)
            .finish()
    }
}

/// Raise and release events of the same episode compare equal.
impl<M> PartialEq for AlertEvent<M> {
    fn eq(&self, other: &Self) -> bool {
        self.config.id == other.config.id
            && self.duration == other.duration
            && self.since_millis == other.since_millis
    }
}

/// Direction of an alert transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Raised,
    Released,
}

/// Alert state of one (config, duration) pair.
pub struct AlertState<M> {
    config: Arc<AlertConfig<M>>,
    duration: Duration,
    active: bool,
    since_millis: Option<i64>,
    since_value: Option<M>,
}

impl<M> fmt::Debug for AlertState<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertState")
            .field("id", &self.config.id)
            .field("duration", &self.duration)
            .field("active", &self.active)
            .finish()
    }
}

impl<M: Clone> AlertState<M> {
    pub fn new(config: Arc<AlertConfig<M>>, duration: Duration) -> Self {
        Self {
            config,
            duration,
            active: false,
            since_millis: None,
            since_value: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Evaluates the alert against `statistic` observed at `at_millis`.
    ///
    /// Returns the transition event, if any, after passing it to every
    /// listener. Extractor and predicate errors leave the state unchanged.
    pub fn check(&mut self, statistic: &dyn Statistic, at_millis: i64) -> Result<Option<AlertEvent<M>>> {
        let value = (self.config.extractor)(statistic, self.duration)?;
        let raised = (self.config.predicate)(&value)?;

        if raised == self.active {
            return Ok(None);
        }
        self.active = raised;

        let duration_millis = millis_of(self.duration);
        let (since_millis, value_at_since, until_millis) = if raised {
            let since = at_millis.saturating_sub(duration_millis);
            self.since_millis = Some(since);
            self.since_value = Some(value.clone());
            (since, value, None)
        } else {
            let since = *self
                .since_millis
                .get_or_insert(at_millis.saturating_sub(duration_millis));
            let since_value = self.since_value.get_or_insert(value).clone();
            (since, since_value, Some(at_millis))
        };

        let event = AlertEvent {
            config: Arc::clone(&self.config),
            duration: self.duration,
            value_at_since,
            since_millis,
            until_millis,
        };

        for listener in &self.config.listeners {
            listener(&event);
        }

        Ok(Some(event))
    }
}

/// Alert state with its metric type erased, so states of different metrics
/// can be checked together.
pub trait AlertCheck: Send {
    fn id(&self) -> &AlertId;

    fn duration(&self) -> Duration;

    fn is_active(&self) -> bool;

    fn check(&mut self, statistic: &dyn Statistic, at_millis: i64) -> Result<Option<Transition>>;
}

impl<M: Clone + Send + 'static> AlertCheck for AlertState<M> {
    fn id(&self) -> &AlertId {
        &self.config.id
    }

    fn duration(&self) -> Duration {
        self.duration
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn check(&mut self, statistic: &dyn Statistic, at_millis: i64) -> Result<Option<Transition>> {
        let event = AlertState::check(self, statistic, at_millis)?;
        Ok(event.map(|e| {
            if e.is_raised() {
                Transition::Raised
            } else {
                Transition::Released
            }
        }))
    }
}

/// Identifier of the built-in traffic alert.
pub const HIGH_TRAFFIC_ID: &str = "high-traffic";

/// Alert raised while the average request rate over the watched duration
/// is at least `threshold` requests per second.
pub fn high_traffic(threshold: f64) -> AlertConfig<f64> {
    AlertConfig::new(
        AlertId::new(HIGH_TRAFFIC_ID),
        "High traffic",
        |statistic: &dyn Statistic, duration: Duration| {
            let seconds = duration.as_secs_f64();
            if seconds <= 0.0 {
                anyhow::bail!("watched duration must be positive to compute a request rate");
            }
            Ok(statistic.overall().request_count as f64 / seconds)
        },
        move |rate: &f64| Ok(*rate >= threshold),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::reader::event::LogEvent;
    use crate::stat::{by_request_count, StatisticAggregator};

    const DURATION: Duration = Duration::from_secs(1);

    fn stat_with(requests: u64) -> StatisticAggregator {
        let stat = StatisticAggregator::new(10, by_request_count);
        for _ in 0..requests {
            stat.accept(&LogEvent::new(0, "api", Some(1)));
        }
        stat
    }

    fn over_42(calls: Arc<AtomicUsize>) -> Arc<AlertConfig<u64>> {
        Arc::new(
            AlertConfig::new(
                AlertId::new("over-42"),
                "Do not get bigger than 42!",
                |stat: &dyn Statistic, _| Ok(stat.overall().request_count),
                |value: &u64| Ok(*value > 42),
            )
            .on_alert(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_below_threshold_never_fires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut state = AlertState::new(over_42(Arc::clone(&calls)), DURATION);

        assert!(!state.is_active());
        state.check(&stat_with(13), 1_000).expect("check");
        state.check(&stat_with(25), 2_000).expect("check");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!state.is_active());
    }

    #[test]
    fn test_raise_and_release_sequence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut state = AlertState::new(over_42(Arc::clone(&calls)), DURATION);

        assert!(state.check(&stat_with(13), 1_000).expect("check").is_none());

        let raised = state
            .check(&stat_with(43), 2_000)
            .expect("check")
            .expect("raise");
        assert!(raised.is_raised());
        assert_eq!(raised.since_millis, 1_000);
        assert_eq!(raised.value_at_since, 43);
        assert!(state.is_active());

        // Still above the threshold: no new transition.
        assert!(state.check(&stat_with(52), 3_000).expect("check").is_none());

        let released = state
            .check(&stat_with(20), 4_000)
            .expect("check")
            .expect("release");
        assert!(!released.is_raised());
        assert_eq!(released.since_millis, 1_000);
        assert_eq!(released.until_millis, Some(4_000));
        assert_eq!(released.value_at_since, 43);
        assert_eq!(released, raised);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!state.is_active());
    }

    #[test]
    fn test_failing_predicate_leaves_state_unchanged() {
        let config = Arc::new(AlertConfig::new(
            AlertId::new("broken"),
            "Broken",
            |stat: &dyn Statistic, _| Ok(stat.overall().request_count),
            |value: &u64| {
                if *value > 100 {
                    anyhow::bail!("metric out of range: {value}");
                }
                Ok(*value > 42)
            },
        ));
        let mut state = AlertState::new(config, DURATION);

        state.check(&stat_with(43), 1_000).expect("raise");
        assert!(state.check(&stat_with(101), 2_000).is_err());
        assert!(state.is_active());
    }

    #[test]
    fn test_states_are_independent_per_duration() {
        let config = over_42(Arc::new(AtomicUsize::new(0)));
        let mut short = AlertState::new(Arc::clone(&config), Duration::from_secs(1));
        let mut long = AlertState::new(config, Duration::from_secs(10));

        short.check(&stat_with(50), 1_000).expect("check");
        long.check(&stat_with(10), 1_000).expect("check");

        assert!(short.is_active());
        assert!(!long.is_active());
    }

    #[test]
    fn test_high_traffic_rate() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let config = Arc::new(high_traffic(10.0).on_alert(move |event: &AlertEvent<f64>| {
            sink.lock().push((event.value_at_since, event.is_raised()));
        }));
        let mut state: Box<dyn AlertCheck> =
            Box::new(AlertState::new(config, Duration::from_secs(2)));

        assert_eq!(state.check(&stat_with(19), 10_000).expect("check"), None);
        assert_eq!(
            state.check(&stat_with(20), 11_000).expect("check"),
            Some(Transition::Raised)
        );
        assert_eq!(
            state.check(&stat_with(3), 12_000).expect("check"),
            Some(Transition::Released)
        );

        assert_eq!(*events.lock(), vec![(10.0, true), (10.0, false)]);
        assert_eq!(state.id().as_str(), HIGH_TRAFFIC_ID);
    }

    #[test]
    fn test_high_traffic_rejects_zero_duration() {
        let mut state = AlertState::new(Arc::new(high_traffic(1.0)), Duration::ZERO);
        assert!(state.check(&stat_with(1), 0).is_err());
    }
}
