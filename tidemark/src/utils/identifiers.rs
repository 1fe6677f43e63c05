//! Run identifiers and name validation.

use crate::errors::{Result, TidemarkError};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/// Generates a new time-ordered run identifier (UUID v7).
#[must_use]
pub fn new_run_id() -> Uuid {
    Uuid::now_v7()
}

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,127}$").ok())
        .as_ref()
}

/// Validates a flow or entity name.
///
/// Names become path segments in the staging namespace and keys in the
/// journal, so they are restricted to ASCII alphanumerics, `_`, `.` and `-`,
/// must start with an alphanumeric, and are at most 128 characters.
pub fn validate_name(field: &str, value: &str) -> Result<()> {
    let Some(pattern) = name_pattern() else {
        return Err(TidemarkError::Internal("name pattern failed to compile".to_string()));
    };
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(TidemarkError::configuration(format!(
            "{field} '{value}' must match [A-Za-z0-9][A-Za-z0-9_.-]{{0,127}}"
        )))
    }
}
