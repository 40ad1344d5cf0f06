//! Outputs of the monitor: log records, the alert journal and health metrics.

pub mod display;
pub mod health;
pub mod journal;

use chrono::{DateTime, FixedOffset, SecondsFormat};

/// Formats epoch milliseconds as RFC 3339 in `zone`.
pub fn format_millis(millis: i64, zone: &FixedOffset) -> String {
    match DateTime::from_timestamp_millis(millis) {
        Some(ts) => ts
            .with_timezone(zone)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        None => millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_millis_in_zone() {
        let utc = FixedOffset::east_opt(0).expect("utc");
        let paris = FixedOffset::east_opt(2 * 3_600).expect("offset");

        assert_eq!(format_millis(1_525_881_642_000, &utc), "2018-05-09T16:00:42Z");
        assert_eq!(
            format_millis(1_525_881_642_000, &paris),
            "2018-05-09T18:00:42+02:00"
        );
    }
}
