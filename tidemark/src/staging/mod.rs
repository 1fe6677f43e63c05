//! Two-phase destination writes.
//!
//! Artifacts of an attempt are written under a private namespace
//! (`_staging/<flow>/<entity>/<run_id>/attempt-<n>/`) and promoted to the
//! destination only when the whole attempt succeeded.

mod backend;
mod store;
mod writer;

pub use backend::{sha256_hex, LocalStagingBackend, StagingBackend};
pub use store::StagedBatchStore;
pub use writer::{
    validate_relative_path, CommitSummary, EntryState, ManifestEntry, StagedWriter,
    StagingManifest, StagingScope, STAGING_DIR,
};
