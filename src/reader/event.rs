/// Anything carrying an event-time timestamp in epoch milliseconds.
pub trait Timestamped {
    fn timestamp_millis(&self) -> i64;
}

/// Section assigned to requests whose path could not be read.
pub const UNKNOWN_SECTION: &str = "";

/// One parsed access log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Request time in epoch milliseconds.
    pub timestamp_millis: i64,
    /// First path segment of the request ("" when unknown).
    pub section: String,
    /// Response size in bytes, `None` when the log carried no valid number.
    pub weight: Option<u64>,
}

impl LogEvent {
    pub fn new(timestamp_millis: i64, section: impl Into<String>, weight: Option<u64>) -> Self {
        Self {
            timestamp_millis,
            section: section.into(),
            weight,
        }
    }

    /// Weight contribution of this event. Invalid weights count as zero.
    #[inline]
    pub fn weight_or_zero(&self) -> u64 {
        self.weight.unwrap_or(0)
    }
}

impl Timestamped for LogEvent {
    #[inline]
    fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_weight_counts_as_zero() {
        let event = LogEvent::new(10, "api", None);
        assert_eq!(event.weight_or_zero(), 0);

        let event = LogEvent::new(10, "api", Some(34));
        assert_eq!(event.weight_or_zero(), 34);
        assert_eq!(event.timestamp_millis(), 10);
    }
}
