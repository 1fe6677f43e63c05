//! Flow configuration.

use super::adapters::RunType;
use crate::errors::{Result, TidemarkError};
use crate::retry::RetryConfig;
use crate::utils::validate_name;
use crate::watermark::WatermarkConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_queue_capacity() -> usize {
    8
}

fn default_io_timeout_ms() -> u64 {
    300_000
}

/// Everything a flow needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Flow name.
    pub flow: String,
    /// Entity moved by this flow.
    pub entity: String,
    /// Full or incremental.
    #[serde(default)]
    pub run_type: RunType,
    /// Tracked column; required for incremental runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<WatermarkConfig>,
    /// Batches buffered between Home and Store.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Limit for each Home/Store call, in milliseconds.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Retry policy for whole attempts.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl FlowConfig {
    /// Creates a full-run config with defaults.
    #[must_use]
    pub fn new(flow: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            flow: flow.into(),
            entity: entity.into(),
            run_type: RunType::Full,
            watermark: None,
            queue_capacity: default_queue_capacity(),
            io_timeout_ms: default_io_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the run type.
    #[must_use]
    pub fn with_run_type(mut self, run_type: RunType) -> Self {
        self.run_type = run_type;
        self
    }

    /// Tracks a watermark column.
    #[must_use]
    pub fn with_watermark(mut self, watermark: WatermarkConfig) -> Self {
        self.watermark = Some(watermark);
        self
    }

    /// Sets the queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the I/O timeout.
    #[must_use]
    pub fn with_io_timeout_ms(mut self, timeout: u64) -> Self {
        self.io_timeout_ms = timeout;
        self
    }

    /// Sets the retry config.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The I/O timeout as a duration.
    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Checks names, limits and the watermark requirement of incremental runs.
    pub fn validate(&self) -> Result<()> {
        validate_name("flow", &self.flow)?;
        validate_name("entity", &self.entity)?;

        if self.queue_capacity == 0 {
            return Err(TidemarkError::configuration("queue_capacity must be at least 1"));
        }
        if self.io_timeout_ms == 0 {
            return Err(TidemarkError::configuration("io_timeout_ms must be positive"));
        }
        if self.run_type == RunType::Incremental && self.watermark.is_none() {
            return Err(TidemarkError::configuration(format!(
                "incremental flow '{}' needs a watermark column",
                self.flow
            )));
        }
        if let Some(wm) = &self.watermark {
            if wm.column.trim().is_empty() {
                return Err(TidemarkError::configuration("watermark column must not be empty"));
            }
        }
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::{MismatchPolicy, WatermarkType};

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: FlowConfig = serde_json::from_value(serde_json::json!({
            "flow": "orders",
            "entity": "orders_2024",
            "run_type": "incremental",
            "watermark": {"column": "updated_at", "type": "timestamp"}
        }))
        .unwrap();

        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.retry.max_attempts, 3);
        let wm = config.watermark.as_ref().unwrap();
        assert_eq!(wm.kind, WatermarkType::Timestamp);
        assert_eq!(wm.mismatch_policy, MismatchPolicy::WarnAndSkip);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_incremental_requires_watermark() {
        let config = FlowConfig::new("orders", "orders_2024").with_run_type(RunType::Incremental);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_names_and_limits() {
        assert!(FlowConfig::new("bad name", "e").validate().is_err());
        assert!(FlowConfig::new("f", "e").with_queue_capacity(0).validate().is_err());
        assert!(FlowConfig::new("f", "e")
            .with_retry(RetryConfig::new().with_max_attempts(0))
            .validate()
            .is_err());
    }
}
