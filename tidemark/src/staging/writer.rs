//! Two-phase writes: stage privately, then promote every artifact at once.

use super::backend::StagingBackend;
use crate::errors::{Result, TidemarkError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Top-level directory of every staging namespace.
pub const STAGING_DIR: &str = "_staging";

/// Identifies the attempt a staging namespace belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingScope {
    /// Flow name.
    pub flow: String,
    /// Entity name.
    pub entity: String,
    /// Run identifier.
    pub run_id: Uuid,
    /// Attempt number.
    pub attempt: u32,
}

impl StagingScope {
    /// Creates a scope.
    #[must_use]
    pub fn new(flow: impl Into<String>, entity: impl Into<String>, run_id: Uuid, attempt: u32) -> Self {
        Self {
            flow: flow.into(),
            entity: entity.into(),
            run_id,
            attempt,
        }
    }

    /// `_staging/<flow>/<entity>/<run_id>/attempt-<n>`
    #[must_use]
    pub fn namespace(&self) -> String {
        format!(
            "{STAGING_DIR}/{}/{}/{}/attempt-{}",
            self.flow, self.entity, self.run_id, self.attempt
        )
    }
}

/// Promotion state of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Written to staging, not yet promoted.
    Staged,
    /// Promotion started and its outcome is unknown.
    Promoting,
    /// Moved to its final location.
    Promoted,
}

/// One staged artifact and where it will land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to both the namespace and the destination.
    pub relative: String,
    /// Staging location.
    pub staged: String,
    /// Final location.
    pub target: String,
    /// Promotion state.
    pub state: EntryState,
}

/// Ordered staged/final location pairs of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingManifest {
    entries: Vec<ManifestEntry>,
}

impl StagingManifest {
    /// Entries in staging order.
    #[must_use]
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of promoted entries.
    #[must_use]
    pub fn promoted(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Promoted)
            .count()
    }

    fn contains(&self, relative: &str) -> bool {
        self.entries.iter().any(|e| e.relative == relative)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Checks a relative artifact path.
///
/// Paths must be non-empty, relative, `/`-separated and free of `.`, `..`
/// and empty segments.
pub fn validate_relative_path(relative: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(TidemarkError::configuration(format!(
            "invalid staging path '{relative}': {reason}"
        )))
    };

    if relative.is_empty() {
        return invalid("empty");
    }
    if relative.starts_with('/') || relative.contains('\\') || relative.contains(':') {
        return invalid("must be a relative '/'-separated path");
    }
    if relative
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return invalid("contains an empty, '.' or '..' segment");
    }
    Ok(())
}

/// Summary of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    /// Entries promoted.
    pub promoted: usize,
    /// Whether the destination was cleared first.
    pub replaced_destination: bool,
}

/// Writes artifacts under a private namespace and promotes them on commit.
///
/// ```text
/// begin(scope) -> stage(path)* -> commit()
///                              \-> rollback()
/// ```
pub struct StagedWriter {
    backend: Arc<dyn StagingBackend>,
    destination: String,
    replace_destination: bool,
    scope: Option<StagingScope>,
    manifest: StagingManifest,
}

impl std::fmt::Debug for StagedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedWriter")
            .field("destination", &self.destination)
            .field("replace_destination", &self.replace_destination)
            .field("scope", &self.scope)
            .field("manifest", &self.manifest)
            .finish()
    }
}

impl StagedWriter {
    /// Creates a writer promoting into `destination`.
    #[must_use]
    pub fn new(backend: Arc<dyn StagingBackend>, destination: impl Into<String>) -> Self {
        Self {
            backend,
            destination: destination.into().trim_matches('/').to_string(),
            replace_destination: false,
            scope: None,
            manifest: StagingManifest::default(),
        }
    }

    /// Clears the destination before promoting (full-replace runs).
    pub fn set_replace_destination(&mut self, replace: bool) {
        self.replace_destination = replace;
    }

    /// The backend artifacts are written to.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StagingBackend> {
        &self.backend
    }

    /// The current manifest.
    #[must_use]
    pub fn manifest(&self) -> &StagingManifest {
        &self.manifest
    }

    /// The active scope, if `begin` was called.
    #[must_use]
    pub fn scope(&self) -> Option<&StagingScope> {
        self.scope.as_ref()
    }

    /// The destination prefix.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Opens a fresh namespace for an attempt.
    pub async fn begin(&mut self, scope: StagingScope) -> Result<()> {
        if !self.manifest.is_empty() {
            return Err(TidemarkError::Internal(format!(
                "begin called with {} uncommitted staged entries",
                self.manifest.len()
            )));
        }
        validate_relative_path(&self.destination)?;
        let namespace = scope.namespace();
        self.backend.clear_prefix(&namespace).await?;
        debug!(namespace = %namespace, "staging namespace opened");
        self.scope = Some(scope);
        Ok(())
    }

    /// Registers an artifact and returns the location to write it to.
    pub fn stage(&mut self, relative: &str) -> Result<String> {
        let Some(scope) = &self.scope else {
            return Err(TidemarkError::Internal("stage called before begin".to_string()));
        };
        validate_relative_path(relative)?;
        if self.manifest.contains(relative) {
            return Err(TidemarkError::Internal(format!(
                "'{relative}' is already staged"
            )));
        }

        let staged = format!("{}/{relative}", scope.namespace());
        self.manifest.entries.push(ManifestEntry {
            relative: relative.to_string(),
            staged: staged.clone(),
            target: format!("{}/{relative}", self.destination),
            state: EntryState::Staged,
        });
        Ok(staged)
    }

    /// Promotes every staged artifact to its final location.
    ///
    /// Nothing is promoted unless every entry exists in staging and follows
    /// the namespace convention. A failure partway through promotion is a
    /// [`TidemarkError::DataIntegrity`]; the entries promoted before it stay
    /// marked so `rollback` can remove them. An entry is marked
    /// [`EntryState::Promoting`] before its rename or copy starts, so a
    /// commit dropped mid-promotion still has its target rolled back.
    pub async fn commit(&mut self) -> Result<CommitSummary> {
        let Some(scope) = self.scope.clone() else {
            return Err(TidemarkError::Internal("commit called before begin".to_string()));
        };
        let namespace = scope.namespace();
        let total = self.manifest.len();

        for entry in &self.manifest.entries {
            let expected = format!("{namespace}/{}", entry.relative);
            if entry.staged != expected {
                return Err(TidemarkError::data_integrity(format!(
                    "staged location '{}' does not match namespace '{namespace}'",
                    entry.staged
                )));
            }
            let present = self.backend.exists(&entry.staged).await.map_err(|e| {
                TidemarkError::data_integrity(format!(
                    "cannot verify staged '{}': {e}",
                    entry.staged
                ))
            })?;
            if !present {
                return Err(TidemarkError::data_integrity(format!(
                    "staged artifact '{}' is missing; nothing was promoted",
                    entry.staged
                )));
            }
        }

        if self.replace_destination {
            self.backend
                .clear_prefix(&self.destination)
                .await
                .map_err(|e| {
                    TidemarkError::data_integrity(format!(
                        "cannot clear destination '{}': {e}",
                        self.destination
                    ))
                })?;
        }

        for index in 0..total {
            self.manifest.entries[index].state = EntryState::Promoting;
            let entry = &self.manifest.entries[index];
            if let Err(e) = self.promote(entry).await {
                return Err(TidemarkError::data_integrity(format!(
                    "promotion failed on entry {} of {total} ('{}'): {e}; {index} entries already promoted",
                    index + 1,
                    entry.relative
                )));
            }
            self.manifest.entries[index].state = EntryState::Promoted;
        }

        if let Err(e) = self.backend.clear_prefix(&namespace).await {
            warn!(namespace = %namespace, error = %e, "cannot remove empty staging namespace");
        }

        info!(
            flow = %scope.flow,
            entity = %scope.entity,
            run_id = %scope.run_id,
            attempt = scope.attempt,
            promoted = total,
            destination = %self.destination,
            "staged artifacts committed"
        );

        let summary = CommitSummary {
            promoted: total,
            replaced_destination: self.replace_destination,
        };
        self.manifest.clear();
        self.scope = None;
        Ok(summary)
    }

    async fn promote(&self, entry: &ManifestEntry) -> Result<()> {
        if self.backend.supports_rename() {
            return self.backend.rename(&entry.staged, &entry.target).await;
        }

        self.backend.copy(&entry.staged, &entry.target).await?;
        let staged_sum = self.backend.checksum(&entry.staged).await?;
        let target_sum = self.backend.checksum(&entry.target).await?;
        if staged_sum != target_sum {
            return Err(TidemarkError::data_integrity(format!(
                "checksum mismatch after copy: {staged_sum} != {target_sum}"
            )));
        }
        self.backend.delete(&entry.staged).await
    }

    /// Deletes every artifact of the manifest, staged or promoted, and
    /// clears it.
    ///
    /// Every deletion is attempted; the first failure is returned afterwards.
    pub async fn rollback(&mut self) -> Result<()> {
        let mut failures = Vec::new();

        for entry in &self.manifest.entries {
            if let Err(e) = self.backend.delete(&entry.staged).await {
                failures.push(format!("{}: {e}", entry.staged));
            }
            if entry.state != EntryState::Staged {
                if let Err(e) = self.backend.delete(&entry.target).await {
                    failures.push(format!("{}: {e}", entry.target));
                }
            }
        }

        if let Some(scope) = &self.scope {
            if let Err(e) = self.backend.clear_prefix(&scope.namespace()).await {
                failures.push(format!("{}: {e}", scope.namespace()));
            }
        }

        let removed = self.manifest.len();
        self.manifest.clear();
        self.scope = None;

        if failures.is_empty() {
            debug!(removed, "staging rolled back");
            Ok(())
        } else {
            Err(TidemarkError::data_integrity(format!(
                "rollback left artifacts behind: {}",
                failures.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::LocalStagingBackend;
    use crate::testing::FailingStagingBackend;
    use std::time::Duration;
    use tempfile::TempDir;

    fn scope(attempt: u32) -> StagingScope {
        StagingScope::new("orders", "orders_2024", Uuid::nil(), attempt)
    }

    async fn writer_with(dir: &TempDir, files: &[&str]) -> StagedWriter {
        let backend = Arc::new(LocalStagingBackend::new(dir.path()));
        let mut writer = StagedWriter::new(backend.clone(), "warehouse/orders");
        writer.begin(scope(1)).await.unwrap();
        for file in files {
            let key = writer.stage(file).unwrap();
            backend.write(&key, file.as_bytes()).await.unwrap();
        }
        writer
    }

    #[test]
    fn test_namespace_convention() {
        assert_eq!(
            scope(2).namespace(),
            "_staging/orders/orders_2024/00000000-0000-0000-0000-000000000000/attempt-2"
        );
    }

    #[test]
    fn test_relative_path_validation() {
        assert!(validate_relative_path("part-00001.jsonl").is_ok());
        assert!(validate_relative_path("dt=2024-05-01/part.jsonl").is_ok());
        for bad in ["", "/abs", "a/../b", "a//b", "./a", "C:\\x"] {
            assert!(validate_relative_path(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_stage_requires_begin() {
        let dir = TempDir::new().unwrap();
        let mut writer =
            StagedWriter::new(Arc::new(LocalStagingBackend::new(dir.path())), "dest");
        assert!(writer.stage("a.jsonl").is_err());
    }

    #[tokio::test]
    async fn test_commit_promotes_everything() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer_with(&dir, &["a.jsonl", "b.jsonl"]).await;

        let summary = writer.commit().await.unwrap();
        assert_eq!(summary.promoted, 2);
        assert!(writer.manifest().is_empty());

        let backend = writer.backend().clone();
        assert_eq!(
            backend.list("warehouse/orders").await.unwrap(),
            vec!["warehouse/orders/a.jsonl", "warehouse/orders/b.jsonl"]
        );
        assert!(backend.list(STAGING_DIR).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_with_copy_verify() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalStagingBackend::new(dir.path()).without_rename());
        let mut writer = StagedWriter::new(backend.clone(), "dest");
        writer.begin(scope(1)).await.unwrap();
        let key = writer.stage("a.jsonl").unwrap();
        backend.write(&key, b"payload").await.unwrap();

        writer.commit().await.unwrap();
        assert_eq!(backend.read("dest/a.jsonl").await.unwrap(), b"payload");
        assert!(!backend.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_entry_blocks_all_promotion() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer_with(&dir, &["a.jsonl"]).await;
        writer.stage("never-written.jsonl").unwrap();

        let err = writer.commit().await.unwrap_err();
        assert!(matches!(err, TidemarkError::DataIntegrity(_)));
        assert_eq!(writer.manifest().promoted(), 0);
        assert!(!writer.backend().exists("warehouse/orders/a.jsonl").await.unwrap());
    }

    #[tokio::test]
    async fn test_full_replace_clears_destination() {
        let dir = TempDir::new().unwrap();
        let backend = LocalStagingBackend::new(dir.path());
        backend.write("warehouse/orders/old.jsonl", b"old").await.unwrap();

        let mut writer = writer_with(&dir, &["new.jsonl"]).await;
        writer.set_replace_destination(true);
        writer.commit().await.unwrap();

        assert_eq!(
            backend.list("warehouse/orders").await.unwrap(),
            vec!["warehouse/orders/new.jsonl"]
        );
    }

    #[tokio::test]
    async fn test_rollback_removes_staged_artifacts() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer_with(&dir, &["a.jsonl", "b.jsonl"]).await;

        writer.rollback().await.unwrap();
        assert!(writer.manifest().is_empty());
        assert!(writer.backend().list(STAGING_DIR).await.unwrap().is_empty());

        // a fresh attempt can begin after rollback
        writer.begin(scope(2)).await.unwrap();
    }

    async fn staged_on<B: StagingBackend + 'static>(
        backend: Arc<B>,
        files: &[&str],
    ) -> StagedWriter {
        let mut writer = StagedWriter::new(backend.clone(), "warehouse/orders");
        writer.begin(scope(1)).await.unwrap();
        for file in files {
            let key = writer.stage(file).unwrap();
            backend.write(&key, file.as_bytes()).await.unwrap();
        }
        writer
    }

    #[tokio::test]
    async fn test_kth_promotion_failure_leaves_earlier_entries_until_rollback() {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(LocalStagingBackend::new(dir.path()));
        let failing = Arc::new(FailingStagingBackend::new(local.clone(), 3));
        let mut writer = staged_on(failing, &["a.jsonl", "b.jsonl", "c.jsonl", "d.jsonl"]).await;

        let err = writer.commit().await.unwrap_err();
        assert!(matches!(err, TidemarkError::DataIntegrity(_)));
        assert_eq!(writer.manifest().promoted(), 2);
        assert_eq!(
            local.list("warehouse/orders").await.unwrap(),
            vec!["warehouse/orders/a.jsonl", "warehouse/orders/b.jsonl"]
        );

        writer.rollback().await.unwrap();
        assert!(local.list("warehouse/orders").await.unwrap().is_empty());
        assert!(local.list(STAGING_DIR).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_after_interrupted_commit_removes_in_flight_target() {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(LocalStagingBackend::new(dir.path()));
        let stalling = Arc::new(FailingStagingBackend::stalling(
            local.clone(),
            2,
            Duration::from_secs(30),
        ));
        let mut writer = staged_on(stalling, &["a.jsonl", "b.jsonl", "c.jsonl"]).await;

        let interrupted =
            tokio::time::timeout(Duration::from_millis(500), writer.commit()).await;
        assert!(interrupted.is_err());

        let states: Vec<EntryState> =
            writer.manifest().entries().iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![EntryState::Promoted, EntryState::Promoting, EntryState::Staged]
        );
        assert_eq!(local.list("warehouse/orders").await.unwrap().len(), 2);

        writer.rollback().await.unwrap();
        assert!(local.list("warehouse/orders").await.unwrap().is_empty());
        assert!(local.list(STAGING_DIR).await.unwrap().is_empty());
    }
}
