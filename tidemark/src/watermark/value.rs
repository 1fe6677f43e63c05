//! Typed watermark values and their persisted string form.

use crate::errors::{Result, TidemarkError};
use crate::utils::{format_timestamp, parse_timestamp, truncate_to_micros, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Type family of a tracked column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkType {
    /// UTC timestamp, compared chronologically.
    Timestamp,
    /// 64-bit signed integer.
    Integer,
    /// UTF-8 string, compared lexicographically.
    String,
}

impl WatermarkType {
    /// The persisted type tag.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Integer => "integer",
            Self::String => "string",
        }
    }
}

impl fmt::Display for WatermarkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatermarkType {
    type Err = TidemarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timestamp" => Ok(Self::Timestamp),
            "integer" => Ok(Self::Integer),
            "string" => Ok(Self::String),
            other => Err(TidemarkError::configuration(format!(
                "unknown watermark type '{other}'"
            ))),
        }
    }
}

/// A watermark value of one type family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatermarkValue {
    /// Timestamp value, microsecond precision.
    Timestamp(Timestamp),
    /// Integer value.
    Integer(i64),
    /// String value.
    String(String),
}

/// Values of different families are unordered.
impl PartialOrd for WatermarkValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl WatermarkValue {
    /// A timestamp value at the microsecond precision it is persisted with.
    #[must_use]
    pub fn timestamp(ts: Timestamp) -> Self {
        Self::Timestamp(truncate_to_micros(ts))
    }

    /// The value at persisted precision, so that `serialize` then
    /// `deserialize` returns it unchanged.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Timestamp(ts) => Self::timestamp(ts),
            other => other,
        }
    }

    /// The type family of this value.
    #[must_use]
    pub fn kind(&self) -> WatermarkType {
        match self {
            Self::Timestamp(_) => WatermarkType::Timestamp,
            Self::Integer(_) => WatermarkType::Integer,
            Self::String(_) => WatermarkType::String,
        }
    }

    /// Renders the value and its type tag for persistence.
    #[must_use]
    pub fn serialize(&self) -> SerializedWatermark {
        let value = match self {
            Self::Timestamp(ts) => format_timestamp(ts),
            Self::Integer(i) => i.to_string(),
            Self::String(s) => s.clone(),
        };
        SerializedWatermark {
            value,
            kind: self.kind(),
        }
    }

    /// Parses a persisted value for the given type family.
    pub fn deserialize(value: &str, kind: WatermarkType) -> Result<Self> {
        match kind {
            WatermarkType::Timestamp => parse_timestamp(value)
                .map(Self::timestamp)
                .map_err(|e| {
                    TidemarkError::configuration(format!(
                        "invalid timestamp watermark '{value}': {e}"
                    ))
                }),
            WatermarkType::Integer => value.trim().parse::<i64>().map(Self::Integer).map_err(|e| {
                TidemarkError::configuration(format!("invalid integer watermark '{value}': {e}"))
            }),
            WatermarkType::String => Ok(Self::String(value.to_string())),
        }
    }

    /// Returns the larger of two values of the same family.
    ///
    /// Returns `None` when the families differ.
    #[must_use]
    pub fn max_of(self, other: Self) -> Option<Self> {
        match self.partial_cmp(&other)? {
            Ordering::Less => Some(other),
            Ordering::Equal | Ordering::Greater => Some(self),
        }
    }
}

impl fmt::Display for WatermarkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize().value)
    }
}

/// The persisted `(value, type)` pair of a watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedWatermark {
    /// Canonical string rendering.
    pub value: String,
    /// Type tag.
    #[serde(rename = "type")]
    pub kind: WatermarkType,
}

impl SerializedWatermark {
    /// Creates a serialized pair.
    #[must_use]
    pub fn new(value: impl Into<String>, kind: WatermarkType) -> Self {
        Self {
            value: value.into(),
            kind,
        }
    }

    /// Parses back into a typed value.
    pub fn parse(&self) -> Result<WatermarkValue> {
        WatermarkValue::deserialize(&self.value, self.kind)
    }
}
