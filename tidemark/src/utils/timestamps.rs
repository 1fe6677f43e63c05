//! Timestamp utilities.
//!
//! Watermark timestamps are normalized to UTC with microsecond precision so
//! that a value survives a trip through the journal unchanged.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Errors that can occur during timestamp parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    /// The timestamp string is empty.
    #[error("Empty timestamp string")]
    EmptyString,

    /// The timestamp value is invalid.
    #[error("Invalid timestamp: {0}")]
    InvalidFormat(String),
}

/// Returns the current UTC timestamp truncated to microseconds.
#[must_use]
pub fn now_utc() -> Timestamp {
    truncate_to_micros(Utc::now())
}

/// Drops sub-microsecond precision.
#[must_use]
pub fn truncate_to_micros(ts: Timestamp) -> Timestamp {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// Formats a timestamp as RFC 3339 with microseconds and a `Z` suffix.
///
/// ```
/// use tidemark::utils::{format_timestamp, parse_timestamp};
///
/// let ts = parse_timestamp("2024-05-01T00:00:00Z").unwrap();
/// assert_eq!(format_timestamp(&ts), "2024-05-01T00:00:00.000000Z");
/// ```
#[must_use]
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp string into UTC.
///
/// Accepts RFC 3339 (with `Z` or an offset), naive ISO 8601 date-times
/// (interpreted as UTC) and bare dates.
pub fn parse_timestamp(input: &str) -> Result<Timestamp, TimestampError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(TimestampError::EmptyString);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(truncate_to_micros(dt.with_timezone(&Utc)));
    }

    let naive_formats = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for fmt in naive_formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(truncate_to_micros(Utc.from_utc_datetime(&naive)));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }

    Err(TimestampError::InvalidFormat(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_rfc3339_zulu() {
        let dt = parse_timestamp("2024-05-01T00:00:00Z").unwrap();
        assert_eq!(dt.year(), 2024);
        assert_eq!(dt.month(), 5);
        assert_eq!(dt.day(), 1);
    }

    #[test]
    fn test_parse_offset_normalizes_to_utc() {
        let dt = parse_timestamp("2024-05-01T02:00:00+02:00").unwrap();
        assert_eq!(dt.hour(), 0);
    }

    #[test]
    fn test_parse_naive_and_date_only() {
        let naive = parse_timestamp("2024-05-01 12:30:00").unwrap();
        assert_eq!(naive.minute(), 30);

        let date = parse_timestamp("2024-05-01").unwrap();
        assert_eq!(date.hour(), 0);
    }

    #[test]
    fn test_parse_empty_string() {
        assert_eq!(parse_timestamp("  "), Err(TimestampError::EmptyString));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_timestamp("yesterday-ish"),
            Err(TimestampError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_nanoseconds_are_truncated() {
        let dt = parse_timestamp("2024-05-01T00:00:00.123456789Z").unwrap();
        assert_eq!(dt.nanosecond(), 123_456_000);
        assert_eq!(format_timestamp(&dt), "2024-05-01T00:00:00.123456Z");
    }
}
