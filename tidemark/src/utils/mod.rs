//! Utility functions for run identifiers and timestamp handling.

pub mod identifiers;
pub mod timestamps;

pub use identifiers::{new_run_id, validate_name};
pub use timestamps::{
    format_timestamp, now_utc, parse_timestamp, truncate_to_micros, Timestamp, TimestampError,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_time_ordered() {
        let first = new_run_id();
        let second = new_run_id();
        assert_eq!(first.get_version_num(), 7);
        assert!(first <= second);
    }

    #[test]
    fn test_format_then_parse() {
        let now = now_utc();
        let parsed = parse_timestamp(&format_timestamp(&now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }
}
