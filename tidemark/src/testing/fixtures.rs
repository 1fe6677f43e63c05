//! Batch and journal fixtures.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::batch::{row, Batch, Value};
use crate::journal::{Journal, MemoryJournalBackend};

/// One batch per inclusive range, each row carrying `column = i`.
#[must_use]
pub fn integer_batches(column: &str, ranges: &[(i64, i64)]) -> Vec<Batch> {
    ranges
        .iter()
        .map(|&(lo, hi)| (lo..=hi).map(|i| row([(column, Value::from(i))])).collect())
        .collect()
}

/// `batches` batches of `per_batch` rows, one hour apart starting at `start`.
#[must_use]
pub fn timestamp_batches(
    column: &str,
    start: DateTime<Utc>,
    batches: usize,
    per_batch: usize,
) -> Vec<Batch> {
    let mut hour: i64 = 0;
    (0..batches)
        .map(|_| {
            (0..per_batch)
                .map(|_| {
                    let ts = start + Duration::hours(hour);
                    hour += 1;
                    row([(column, Value::from(ts))])
                })
                .collect()
        })
        .collect()
}

/// A journal over an in-memory backend, plus the backend for inspection.
#[must_use]
pub fn memory_journal() -> (Arc<Journal>, Arc<MemoryJournalBackend>) {
    let backend = Arc::new(MemoryJournalBackend::new());
    let journal = Journal::new(Arc::clone(&backend) as Arc<dyn crate::journal::JournalBackend>);
    (Arc::new(journal), backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_batches_are_hourly() {
        let start = Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap();
        let batches = timestamp_batches("updated_at", start, 5, 5);

        assert_eq!(batches.len(), 5);
        let last = batches[4].rows()[4].get("updated_at").unwrap();
        assert_eq!(last, &Value::from(start + Duration::hours(24)));
    }

    #[test]
    fn test_integer_batches() {
        let batches = integer_batches("id", &[(1, 3), (4, 4)]);
        assert_eq!(batches[0].row_count(), 3);
        assert_eq!(batches[1].rows()[0].get("id"), Some(&Value::from(4)));
    }
}
