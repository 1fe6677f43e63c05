//! Run records and the persisted journal snapshot.

use crate::errors::TidemarkError;
use crate::utils::{now_utc, Timestamp};
use crate::watermark::{SerializedWatermark, WatermarkType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Version of the snapshot envelope written by this crate.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run has started and not finished.
    Running,
    /// The run committed its output.
    Succeeded,
    /// The run gave up.
    Failed,
}

impl RunStatus {
    /// Returns true for finished runs.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One journaled run of a (flow, entity) pair.
///
/// A record is created as [`RunStatus::Running`] and finalized by
/// [`RunRecord::succeeded`] or [`RunRecord::failed`], which consume it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Flow name.
    pub flow: String,
    /// Entity name.
    pub entity: String,
    /// Run identifier, constant across attempts.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: Timestamp,
    /// When the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    /// Current status.
    pub status: RunStatus,
    /// Rows written by the committed attempt.
    #[serde(default)]
    pub rows_moved: u64,
    /// Attempts made.
    #[serde(default)]
    pub attempts: u32,
    /// Serialized watermark value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_value: Option<String>,
    /// Watermark type tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_type: Option<WatermarkType>,
    /// Error message of a failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error kind of a failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl RunRecord {
    /// Creates a running record.
    #[must_use]
    pub fn running(flow: impl Into<String>, entity: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            flow: flow.into(),
            entity: entity.into(),
            run_id,
            started_at: now_utc(),
            ended_at: None,
            status: RunStatus::Running,
            rows_moved: 0,
            attempts: 0,
            watermark_value: None,
            watermark_type: None,
            error: None,
            error_kind: None,
        }
    }

    /// Finalizes the record as succeeded.
    #[must_use]
    pub fn succeeded(
        mut self,
        rows_moved: u64,
        attempts: u32,
        watermark: Option<SerializedWatermark>,
    ) -> Self {
        self.status = RunStatus::Succeeded;
        self.ended_at = Some(now_utc());
        self.rows_moved = rows_moved;
        self.attempts = attempts;
        if let Some(wm) = watermark {
            self.watermark_value = Some(wm.value);
            self.watermark_type = Some(wm.kind);
        }
        self
    }

    /// Finalizes the record as failed.
    #[must_use]
    pub fn failed(mut self, attempts: u32, error: &TidemarkError) -> Self {
        self.status = RunStatus::Failed;
        self.ended_at = Some(now_utc());
        self.attempts = attempts;
        self.error = Some(error.to_string());
        self.error_kind = Some(error.kind().to_string());
        self
    }

    /// Returns true if the record belongs to the pair.
    #[must_use]
    pub fn is_for(&self, flow: &str, entity: &str) -> bool {
        self.flow == flow && self.entity == entity
    }

    /// The watermark pair, when both halves are present.
    #[must_use]
    pub fn watermark(&self) -> Option<SerializedWatermark> {
        match (&self.watermark_value, self.watermark_type) {
            (Some(value), Some(kind)) => Some(SerializedWatermark::new(value.clone(), kind)),
            _ => None,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}

/// The whole journal as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalSnapshot {
    /// Envelope version.
    pub schema_version: u32,
    /// Records in append order.
    pub records: Vec<RunRecord>,
}

impl Default for JournalSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SNAPSHOT_VERSION,
            records: Vec::new(),
        }
    }
}

impl JournalSnapshot {
    /// Parses a snapshot, rejecting unknown versions.
    pub fn from_json(bytes: &[u8]) -> crate::errors::Result<Self> {
        let snapshot: Self = serde_json::from_slice(bytes)
            .map_err(|e| TidemarkError::journal(format!("corrupt journal snapshot: {e}")))?;
        if snapshot.schema_version > SNAPSHOT_VERSION {
            return Err(TidemarkError::journal(format!(
                "journal snapshot version {} is newer than supported version {SNAPSHOT_VERSION}",
                snapshot.schema_version
            )));
        }
        Ok(snapshot)
    }

    /// Renders the snapshot as pretty JSON.
    pub fn to_json(&self) -> crate::errors::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| TidemarkError::journal(format!("cannot encode journal snapshot: {e}")))
    }

    /// Records of one pair, newest first.
    pub fn history<'a>(
        &'a self,
        flow: &'a str,
        entity: &'a str,
    ) -> impl Iterator<Item = &'a RunRecord> + 'a {
        self.records.iter().rev().filter(move |r| r.is_for(flow, entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_lifecycle() {
        let running = RunRecord::running("orders", "orders_2024", Uuid::nil());
        assert_eq!(running.status, RunStatus::Running);
        assert!(running.ended_at.is_none());

        let done = running.succeeded(
            10,
            2,
            Some(SerializedWatermark::new("42", WatermarkType::Integer)),
        );
        assert_eq!(done.status, RunStatus::Succeeded);
        assert!(done.status.is_terminal());
        assert_eq!(done.rows_moved, 10);
        assert_eq!(
            done.watermark(),
            Some(SerializedWatermark::new("42", WatermarkType::Integer))
        );
    }

    #[test]
    fn test_failed_record_keeps_error() {
        let err = TidemarkError::data_integrity("partial promotion");
        let failed = RunRecord::running("f", "e", Uuid::nil()).failed(3, &err);

        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.attempts, 3);
        assert_eq!(failed.error_kind.as_deref(), Some("data_integrity"));
        assert!(failed.watermark().is_none());
    }

    #[test]
    fn test_snapshot_rejects_corrupt_and_future_versions() {
        let err = JournalSnapshot::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, TidemarkError::JournalPersistence(_)));

        let future = br#"{"schema_version": 99, "records": []}"#;
        assert!(JournalSnapshot::from_json(future).is_err());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut snapshot = JournalSnapshot::default();
        snapshot
            .records
            .push(RunRecord::running("orders", "orders_2024", Uuid::nil()));

        let bytes = snapshot.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["schema_version"], 1);
        assert_eq!(value["records"][0]["status"], "running");
        assert!(value["records"][0].get("error").is_none());

        assert_eq!(JournalSnapshot::from_json(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn test_to_dict() {
        let record = RunRecord::running("orders", "orders_2024", Uuid::nil());
        let dict = record.to_dict();
        assert_eq!(dict.get("flow").unwrap(), "orders");
        assert_eq!(dict.get("status").unwrap(), "running");
    }
}
