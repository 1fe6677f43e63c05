//! Per-attempt high-water-mark tracking.

use super::value::{SerializedWatermark, WatermarkType, WatermarkValue};
use crate::batch::{Batch, ColumnType, Schema, Value};
use crate::errors::{Result, TidemarkError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What to do when a batch carries a value of the wrong type family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Log a warning and ignore the batch's contribution.
    #[default]
    WarnAndSkip,
    /// Fail the attempt with a configuration error.
    FailFast,
}

/// Configuration of the tracked column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkConfig {
    /// Column whose maximum is tracked.
    pub column: String,
    /// Declared type family.
    #[serde(rename = "type")]
    pub kind: WatermarkType,
    /// Behavior on type mismatch.
    #[serde(default)]
    pub mismatch_policy: MismatchPolicy,
}

impl WatermarkConfig {
    /// Creates a config for a column with the default mismatch policy.
    #[must_use]
    pub fn new(column: impl Into<String>, kind: WatermarkType) -> Self {
        Self {
            column: column.into(),
            kind,
            mismatch_policy: MismatchPolicy::default(),
        }
    }

    /// Sets the mismatch policy.
    #[must_use]
    pub fn with_mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.mismatch_policy = policy;
        self
    }
}

/// Result of resolving a journaled watermark against the current schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkResolution {
    /// A usable prior value.
    Found(WatermarkValue),
    /// No prior successful run recorded a watermark.
    NotFound,
    /// A prior value exists but cannot be applied.
    SchemaInvalid(String),
}

/// Maps a column type onto the watermark family that can track it.
fn family_of(column_type: ColumnType) -> Option<WatermarkType> {
    match column_type {
        ColumnType::Integer => Some(WatermarkType::Integer),
        ColumnType::Text => Some(WatermarkType::String),
        ColumnType::Timestamp => Some(WatermarkType::Timestamp),
        ColumnType::Boolean | ColumnType::Float | ColumnType::Binary => None,
    }
}

pub(crate) fn to_watermark_value(value: &Value) -> Option<WatermarkValue> {
    match value {
        Value::Integer(i) => Some(WatermarkValue::Integer(*i)),
        Value::Text(s) => Some(WatermarkValue::String(s.clone())),
        Value::Timestamp(ts) => Some(WatermarkValue::timestamp(*ts)),
        Value::Null | Value::Boolean(_) | Value::Float(_) => None,
    }
}

/// Tracks the running maximum of one column across the batches of an attempt.
///
/// The value never decreases: a batch whose maximum is below the current
/// value leaves it unchanged.
#[derive(Debug, Clone)]
pub struct Watermark {
    entity: String,
    config: WatermarkConfig,
    seed: Option<WatermarkValue>,
    current: Option<WatermarkValue>,
    skipped_batches: u64,
}

impl Watermark {
    /// Creates an unseeded tracker.
    #[must_use]
    pub fn new(entity: impl Into<String>, config: WatermarkConfig) -> Self {
        Self {
            entity: entity.into(),
            config,
            seed: None,
            current: None,
            skipped_batches: 0,
        }
    }

    /// The tracked entity.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// The tracked column.
    #[must_use]
    pub fn column(&self) -> &str {
        &self.config.column
    }

    /// The declared type family.
    #[must_use]
    pub fn kind(&self) -> WatermarkType {
        self.config.kind
    }

    /// The current value, if any batch or seed supplied one.
    #[must_use]
    pub fn current(&self) -> Option<&WatermarkValue> {
        self.current.as_ref()
    }

    /// The pre-attempt seed.
    #[must_use]
    pub fn seed_value(&self) -> Option<&WatermarkValue> {
        self.seed.as_ref()
    }

    /// Number of batches ignored because of a type mismatch.
    #[must_use]
    pub fn skipped_batches(&self) -> u64 {
        self.skipped_batches
    }

    /// Checks the tracked column against the source schema.
    ///
    /// Must run before any batch is consumed.
    pub fn validate_schema(&self, schema: &Schema) -> Result<()> {
        let column = self.column();
        let Some(column_type) = schema.column_type(column) else {
            return Err(TidemarkError::configuration(format!(
                "watermark column '{column}' not found in schema of entity '{}'",
                self.entity
            )));
        };

        let Some(family) = family_of(column_type) else {
            return Err(TidemarkError::configuration(format!(
                "watermark column '{column}' has unsupported type '{column_type}'"
            )));
        };

        if family != self.kind() {
            return Err(TidemarkError::configuration(format!(
                "watermark column '{column}' is '{column_type}' but was declared '{}'",
                self.kind()
            )));
        }

        Ok(())
    }

    /// Resolves a journaled watermark into a usable lower bound.
    #[must_use]
    pub fn resolve_prior(&self, prior: Option<&SerializedWatermark>) -> WatermarkResolution {
        let Some(prior) = prior else {
            return WatermarkResolution::NotFound;
        };

        if prior.kind != self.kind() {
            return WatermarkResolution::SchemaInvalid(format!(
                "journaled watermark is typed '{}' but column '{}' is declared '{}'",
                prior.kind,
                self.column(),
                self.kind()
            ));
        }

        match prior.parse() {
            Ok(value) => WatermarkResolution::Found(value),
            Err(e) => WatermarkResolution::SchemaInvalid(e.to_string()),
        }
    }

    /// Seeds the tracker with the prior watermark. `reset` restores this value.
    pub fn seed(&mut self, value: WatermarkValue) -> Result<()> {
        let value = value.normalized();
        if value.kind() != self.kind() {
            return Err(TidemarkError::configuration(format!(
                "cannot seed '{}' watermark with a '{}' value",
                self.kind(),
                value.kind()
            )));
        }
        self.seed = Some(value.clone());
        self.current = Some(value);
        Ok(())
    }

    /// Restores the pre-attempt state.
    pub fn reset(&mut self) {
        self.current = self.seed.clone();
        self.skipped_batches = 0;
    }

    /// Folds a batch's maximum into the running value.
    ///
    /// Nulls and rows without the column are ignored. A batch containing a
    /// value of another type family contributes nothing under
    /// [`MismatchPolicy::WarnAndSkip`] and fails under
    /// [`MismatchPolicy::FailFast`].
    pub fn update(&mut self, batch: &Batch) -> Result<()> {
        let batch_max = match self.batch_max(batch) {
            Ok(max) => max,
            Err(found) => {
                let message = format!(
                    "watermark column '{}' of entity '{}' holds a '{found}' value, expected '{}'",
                    self.column(),
                    self.entity,
                    self.kind()
                );
                return match self.config.mismatch_policy {
                    MismatchPolicy::WarnAndSkip => {
                        warn!(
                            entity = %self.entity,
                            column = %self.config.column,
                            rows = batch.row_count(),
                            "{message}; ignoring batch"
                        );
                        self.skipped_batches += 1;
                        Ok(())
                    }
                    MismatchPolicy::FailFast => Err(TidemarkError::configuration(message)),
                };
            }
        };

        let Some(candidate) = batch_max else {
            return Ok(());
        };

        self.current = match self.current.take() {
            None => Some(candidate),
            Some(current) => current.max_of(candidate),
        };

        debug!(
            entity = %self.entity,
            watermark = ?self.current,
            "watermark updated"
        );
        Ok(())
    }

    /// The batch maximum, or the name of the offending type on mismatch.
    fn batch_max(&self, batch: &Batch) -> std::result::Result<Option<WatermarkValue>, String> {
        let mut max: Option<WatermarkValue> = None;

        for value in batch.column(self.column()) {
            if value.is_null() {
                continue;
            }
            let typed = to_watermark_value(value)
                .filter(|v| v.kind() == self.kind())
                .ok_or_else(|| {
                    value
                        .column_type()
                        .map_or_else(|| "null".to_string(), |t| t.to_string())
                })?;

            max = match max {
                None => Some(typed),
                Some(m) => m.max_of(typed),
            };
        }

        Ok(max)
    }

    /// The serialized current value.
    #[must_use]
    pub fn serialize(&self) -> Option<SerializedWatermark> {
        self.current.as_ref().map(WatermarkValue::serialize)
    }
}
