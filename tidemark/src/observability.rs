//! Logging setup and timing helpers.

use crate::errors::{Result, TidemarkError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::Span;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "tidemark=info";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, multi-line.
    #[default]
    Pretty,
    /// Compact single-line text.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

/// Installs a global `tracing` subscriber.
///
/// Uses `RUST_LOG` when set, otherwise [`DEFAULT_LOG_FILTER`]. Fails if a
/// global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };

    installed.map_err(|e| TidemarkError::Internal(format!("failed to install subscriber: {e}")))
}

/// The span every log line of one flow run is recorded under.
#[must_use]
pub fn flow_span(flow: &str, entity: &str, run_id: Uuid) -> Span {
    tracing::info_span!("flow", flow = %flow, entity = %entity, run_id = %run_id)
}

/// Measures the wall-clock duration of an operation.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// The timer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the timer, logging and returning the duration.
    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        tracing::debug!(
            timer = %self.name,
            duration_ms = elapsed.as_secs_f64() * 1000.0,
            "timer finished"
        );
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("attempt");
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(timer.name(), "attempt");
        assert!(timer.finish() >= Duration::from_millis(10));
    }

    #[test]
    fn test_log_format_from_config() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_tracing(LogFormat::Compact);
        assert!(init_tracing(LogFormat::Compact).is_err());
    }
}
