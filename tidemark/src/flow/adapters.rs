//! Capability traits for the data source (Home) and destination (Store).

use crate::batch::{Batch, Schema};
use crate::errors::Result;
use crate::watermark::WatermarkValue;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Whether a run replaces the destination or appends rows above the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// Read everything and replace the destination.
    #[default]
    Full,
    /// Read rows above the last watermark and append.
    Incremental,
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

/// Identity of the attempt a Store is writing for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Flow name.
    pub flow: String,
    /// Entity name.
    pub entity: String,
    /// Run identifier, constant across attempts.
    pub run_id: Uuid,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Run type.
    pub run_type: RunType,
}

/// Filter passed to Home on incremental runs: only rows whose `column`
/// is strictly greater than `value` are read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerBound {
    /// Tracked column.
    pub column: String,
    /// Exclusive lower bound.
    pub value: WatermarkValue,
}

impl LowerBound {
    /// Returns true if a value of the tracked column lies above the bound.
    #[must_use]
    pub fn admits(&self, value: &WatermarkValue) -> bool {
        value > &self.value
    }
}

/// A stream of batches read from Home.
pub type BatchStream = BoxStream<'static, Result<Batch>>;

/// The data source.
///
/// Errors are retried unless their class is fatal.
#[async_trait]
pub trait Home: Send + Sync {
    /// Column names and types of the entity.
    async fn get_schema(&self) -> Result<Schema>;

    /// Streams batches, optionally restricted to rows above a lower bound.
    async fn read_batches(&self, lower_bound: Option<LowerBound>) -> Result<BatchStream>;
}

/// The data destination.
///
/// `finish` commits everything written since `configure_for_run`;
/// `cleanup_staging` discards it.
#[async_trait]
pub trait Store: Send {
    /// Prepares a fresh attempt.
    async fn configure_for_run(&mut self, ctx: &RunContext) -> Result<()>;

    /// Writes one batch.
    async fn write(&mut self, batch: &Batch) -> Result<()>;

    /// Commits the attempt.
    async fn finish(&mut self) -> Result<()>;

    /// Discards everything the attempt wrote.
    async fn cleanup_staging(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_bound_is_exclusive() {
        let bound = LowerBound {
            column: "id".to_string(),
            value: WatermarkValue::Integer(10),
        };
        assert!(!bound.admits(&WatermarkValue::Integer(10)));
        assert!(bound.admits(&WatermarkValue::Integer(11)));
        assert!(!bound.admits(&WatermarkValue::String("11".to_string())));
    }

    #[test]
    fn test_run_type_serde() {
        let run_type: RunType = serde_json::from_str("\"incremental\"").unwrap();
        assert_eq!(run_type, RunType::Incremental);
        assert_eq!(RunType::default().to_string(), "full");
    }
}
