//! Access log line parsing.
//!
//! Reads lines in the common log format:
//!
//! ```text
//! 127.0.0.1 - frank [09/May/2018:16:00:42 +0000] "POST /api/user HTTP/1.0" 200 34
//! ```
//!
//! Parsing is index based and borrows from the input line until the event
//! is built. Only the timestamp is mandatory; a malformed request yields the
//! unknown section and a malformed size yields an invalid weight.

use chrono::DateTime;
use thiserror::Error;

use crate::reader::event::{LogEvent, UNKNOWN_SECTION};

/// Default timestamp layout of access logs, in chrono `strftime` syntax.
pub const DEFAULT_DATE_TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Errors that reject a whole line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing opening bracket of the timestamp")]
    MissingTimestampStart,

    #[error("missing closing bracket of the timestamp")]
    MissingTimestampEnd,

    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
}

/// Line parser consumed by the tail reader.
pub type LineParser = Box<dyn Fn(&str) -> Result<LogEvent, ParseError> + Send + Sync>;

/// Parser for common log format lines.
#[derive(Debug, Clone)]
pub struct AccessLogParser {
    date_time_format: String,
}

impl Default for AccessLogParser {
    fn default() -> Self {
        Self::new(DEFAULT_DATE_TIME_FORMAT)
    }
}

impl AccessLogParser {
    pub fn new(date_time_format: impl Into<String>) -> Self {
        Self {
            date_time_format: date_time_format.into(),
        }
    }

    /// Boxes this parser into the reader's [`LineParser`] shape.
    pub fn into_line_parser(self) -> LineParser {
        Box::new(move |line| self.parse(line))
    }

    /// Parse one line into a [`LogEvent`].
    pub fn parse(&self, line: &str) -> Result<LogEvent, ParseError> {
        let date_start = line.find('[').ok_or(ParseError::MissingTimestampStart)? + 1;
        let date_end = line[date_start..]
            .find(']')
            .map(|i| date_start + i)
            .ok_or(ParseError::MissingTimestampEnd)?;

        let date_str = &line[date_start..date_end];
        let timestamp = DateTime::parse_from_str(date_str, &self.date_time_format).map_err(|e| {
            ParseError::InvalidTimestamp {
                value: date_str.to_string(),
                reason: e.to_string(),
            }
        })?;

        let section = section_of(line, date_end + 1).unwrap_or(UNKNOWN_SECTION);

        Ok(LogEvent {
            timestamp_millis: timestamp.timestamp_millis(),
            section: section.to_string(),
            weight: weight_of(line),
        })
    }
}

/// Extracts the first path segment of the quoted request, starting the
/// search at `from`.
fn section_of(line: &str, from: usize) -> Option<&str> {
    let rest = line.get(from..)?;
    let quote = rest.find('"')?;

    // Skip the HTTP method.
    let after_quote = &rest[quote + 1..];
    let method_end = after_quote.find(' ')?;
    let mut path = &after_quote[method_end + 1..];
    if path.is_empty() {
        return None;
    }
    if let Some(stripped) = path.strip_prefix('/') {
        path = stripped;
    }

    let end = path.find(|c: char| c == '/' || c == ' ')?;
    Some(&path[..end])
}

/// Reads the trailing response size. `None` marks an invalid weight.
fn weight_of(line: &str) -> Option<u64> {
    let last = line.rsplit(' ').next()?;
    last.trim_end().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str =
        r#"127.0.0.1 - frank [09/May/2018:16:00:42 +0000] "POST /api/user HTTP/1.0" 200 34"#;

    #[test]
    fn test_parse_sample_line() {
        let event = AccessLogParser::default().parse(SAMPLE).expect("parse");

        assert_eq!(event.timestamp_millis, 1_525_881_642_000);
        assert_eq!(event.section, "api");
        assert_eq!(event.weight, Some(34));
    }

    #[test]
    fn test_parse_applies_offset() {
        let line = r#"127.0.0.1 - - [09/May/2018:18:00:42 +0200] "GET /report HTTP/1.0" 200 7"#;
        let event = AccessLogParser::default().parse(line).expect("parse");

        assert_eq!(event.timestamp_millis, 1_525_881_642_000);
        assert_eq!(event.section, "report");
    }

    #[test]
    fn test_parse_invalid_size_is_invalid_weight() {
        let line = r#"127.0.0.1 - - [09/May/2018:16:00:42 +0000] "GET /api/user HTTP/1.0" 304 -"#;
        let event = AccessLogParser::default().parse(line).expect("parse");

        assert_eq!(event.weight, None);
        assert_eq!(event.section, "api");
    }

    #[test]
    fn test_parse_malformed_request_is_unknown_section() {
        let line = r#"127.0.0.1 - - [09/May/2018:16:00:42 +0000] garbage 200 12"#;
        let event = AccessLogParser::default().parse(line).expect("parse");

        assert_eq!(event.section, UNKNOWN_SECTION);
        assert_eq!(event.weight, Some(12));
    }

    #[test]
    fn test_parse_root_path_is_empty_section() {
        let line = r#"127.0.0.1 - - [09/May/2018:16:00:42 +0000] "GET / HTTP/1.0" 200 12"#;
        let event = AccessLogParser::default().parse(line).expect("parse");

        assert_eq!(event.section, "");
    }

    #[test]
    fn test_parse_rejects_missing_timestamp() {
        let parser = AccessLogParser::default();

        assert_eq!(
            parser.parse("no timestamp here"),
            Err(ParseError::MissingTimestampStart)
        );
        assert_eq!(
            parser.parse("[09/May/2018:16:00:42 +0000"),
            Err(ParseError::MissingTimestampEnd)
        );
        assert!(matches!(
            parser.parse("[yesterday] \"GET /a HTTP/1.0\" 200 1"),
            Err(ParseError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_custom_format() {
        let parser = AccessLogParser::new("%Y-%m-%dT%H:%M:%S%z");
        let event = parser
            .parse(r#"h - - [2018-05-09T16:00:42+0000] "GET /x/y HTTP/1.1" 200 1"#)
            .expect("parse");

        assert_eq!(event.timestamp_millis, 1_525_881_642_000);
        assert_eq!(event.section, "x");
    }
}
