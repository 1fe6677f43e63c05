//! Watermark tracking for incremental extraction.
//!
//! A watermark is the maximum value of one tracked column seen by the last
//! successful run of an entity. Incremental runs read only rows above it.

mod tracker;
mod value;

pub use tracker::{MismatchPolicy, Watermark, WatermarkConfig, WatermarkResolution};
pub use value::{SerializedWatermark, WatermarkType, WatermarkValue};

pub(crate) use tracker::to_watermark_value;
