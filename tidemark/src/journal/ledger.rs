//! The journal: an append-only ledger of runs, rewritten as a whole snapshot.

use super::backend::{JournalBackend, LocalJournalBackend};
use super::record::{RunRecord, RunStatus};
use crate::errors::{Result, TidemarkError};
use crate::watermark::SerializedWatermark;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Secondary destination for journal records.
///
/// Publishing is best effort: failures are logged and never fail the run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JournalMirror: Send + Sync {
    /// Publishes a record that was durably written to the primary journal.
    async fn publish(&self, record: &RunRecord) -> anyhow::Result<()>;
}

/// Where the local journal lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Workspace root; the snapshot is `<root>/.tidemark/journal.json`.
    pub root: PathBuf,
    /// Overrides the snapshot path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl JournalConfig {
    /// Creates a config for a workspace root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path: None,
        }
    }

    /// Sets an explicit snapshot path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Rejects an empty root.
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(TidemarkError::configuration("journal.root must not be empty"));
        }
        Ok(())
    }
}

/// Durable record of runs and the watermark each (flow, entity) reached.
///
/// Writers within one process serialize through the backend's write lock,
/// so concurrent flows never lose each other's records, even through
/// separate handles onto the same snapshot.
pub struct Journal {
    backend: Arc<dyn JournalBackend>,
    write_lock: Arc<Mutex<()>>,
    mirror: Option<Arc<dyn JournalMirror>>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("location", &self.backend.location())
            .field("mirrored", &self.mirror.is_some())
            .finish()
    }
}

fn as_journal_error(err: TidemarkError) -> TidemarkError {
    match err {
        TidemarkError::JournalPersistence(_) => err,
        other => TidemarkError::journal(other.to_string()),
    }
}

impl Journal {
    /// Creates a journal over a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn JournalBackend>) -> Self {
        Self {
            write_lock: backend.write_lock(),
            backend,
            mirror: None,
        }
    }

    /// Opens the local journal described by the config.
    pub fn open(config: &JournalConfig) -> Result<Self> {
        config.validate()?;
        let backend = match &config.path {
            Some(path) => LocalJournalBackend::at_path(path.clone()),
            None => LocalJournalBackend::new(&config.root),
        };
        Ok(Self::new(Arc::new(backend)))
    }

    /// Adds a best-effort mirror.
    #[must_use]
    pub fn with_mirror(mut self, mirror: Arc<dyn JournalMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// The latest successful watermark of a pair, or `None` when no
    /// successful run recorded one.
    pub async fn get_watermark(
        &self,
        flow: &str,
        entity: &str,
    ) -> Result<Option<SerializedWatermark>> {
        let snapshot = self.backend.load().await.map_err(as_journal_error)?;
        let watermark = snapshot
            .history(flow, entity)
            .find(|r| r.status == RunStatus::Succeeded)
            .and_then(RunRecord::watermark);
        Ok(watermark)
    }

    /// Appends a record and durably rewrites the snapshot.
    ///
    /// The mirror is published only after the primary write succeeded.
    pub async fn record_run(&self, record: RunRecord) -> Result<()> {
        {
            let _guard = self.write_lock.lock().await;
            let mut snapshot = self.backend.load().await.map_err(as_journal_error)?;

            if record.status == RunStatus::Running {
                let open = open_runs(&snapshot.records, &record.flow, &record.entity);
                if open.iter().any(|id| *id != record.run_id) {
                    warn!(
                        flow = %record.flow,
                        entity = %record.entity,
                        run_id = %record.run_id,
                        open_runs = ?open,
                        "another run of this entity is still marked running"
                    );
                }
            }

            snapshot.records.push(record.clone());
            self.backend
                .store(&snapshot)
                .await
                .map_err(as_journal_error)?;
        }

        debug!(
            flow = %record.flow,
            entity = %record.entity,
            run_id = %record.run_id,
            status = %record.status,
            location = %self.backend.location(),
            "journaled run"
        );

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.publish(&record).await {
                warn!(
                    flow = %record.flow,
                    entity = %record.entity,
                    run_id = %record.run_id,
                    error = %e,
                    "journal mirror publish failed"
                );
            }
        }

        Ok(())
    }

    /// Records of a pair, newest first.
    pub async fn history(&self, flow: &str, entity: &str) -> Result<Vec<RunRecord>> {
        let snapshot = self.backend.load().await.map_err(as_journal_error)?;
        let records: Vec<RunRecord> = snapshot.history(flow, entity).cloned().collect();
        Ok(records)
    }

    /// The newest record of a pair, of any status.
    pub async fn latest(&self, flow: &str, entity: &str) -> Result<Option<RunRecord>> {
        let snapshot = self.backend.load().await.map_err(as_journal_error)?;
        let latest = snapshot.history(flow, entity).next().cloned();
        Ok(latest)
    }
}

/// Run ids of a pair with a `running` record and no terminal record.
fn open_runs(records: &[RunRecord], flow: &str, entity: &str) -> Vec<Uuid> {
    let finished: HashSet<Uuid> = records
        .iter()
        .filter(|r| r.is_for(flow, entity) && r.status.is_terminal())
        .map(|r| r.run_id)
        .collect();

    records
        .iter()
        .filter(|r| r.is_for(flow, entity) && r.status == RunStatus::Running)
        .map(|r| r.run_id)
        .filter(|id| !finished.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournalBackend;
    use crate::watermark::WatermarkType;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn memory_journal() -> (Journal, Arc<MemoryJournalBackend>) {
        let backend = Arc::new(MemoryJournalBackend::new());
        (Journal::new(backend.clone()), backend)
    }

    fn succeeded(entity: &str, value: &str) -> RunRecord {
        RunRecord::running("orders", entity, Uuid::now_v7()).succeeded(
            5,
            1,
            Some(SerializedWatermark::new(value, WatermarkType::Integer)),
        )
    }

    #[tokio::test]
    async fn test_no_prior_watermark() {
        let (journal, _) = memory_journal();
        assert_eq!(journal.get_watermark("orders", "orders_2024").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watermark_comes_from_latest_success() {
        let (journal, _) = memory_journal();
        journal.record_run(succeeded("orders_2024", "10")).await.unwrap();
        journal.record_run(succeeded("orders_2024", "20")).await.unwrap();
        journal
            .record_run(
                RunRecord::running("orders", "orders_2024", Uuid::now_v7())
                    .failed(3, &TidemarkError::transient("down")),
            )
            .await
            .unwrap();
        journal.record_run(succeeded("orders_2025", "99")).await.unwrap();

        let wm = journal.get_watermark("orders", "orders_2024").await.unwrap();
        assert_eq!(wm, Some(SerializedWatermark::new("20", WatermarkType::Integer)));

        let latest = journal.latest("orders", "orders_2024").await.unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Failed);
        assert_eq!(journal.history("orders", "orders_2024").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_primary_failure_is_journal_error() {
        let (journal, backend) = memory_journal();
        backend.fail_next_stores(1);

        let err = journal
            .record_run(succeeded("orders_2024", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TidemarkError::JournalPersistence(_)));
        assert!(backend.snapshot().records.is_empty());
    }

    #[tokio::test]
    async fn test_mirror_failure_is_only_logged() {
        let mut mirror = MockJournalMirror::new();
        mirror
            .expect_publish()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("mirror offline")));

        let (journal, backend) = memory_journal();
        let journal = journal.with_mirror(Arc::new(mirror));

        journal.record_run(succeeded("orders_2024", "1")).await.unwrap();
        assert_eq!(backend.snapshot().records.len(), 1);
    }

    #[tokio::test]
    async fn test_mirror_not_called_when_primary_fails() {
        let mut mirror = MockJournalMirror::new();
        mirror.expect_publish().times(0);

        let (journal, backend) = memory_journal();
        backend.fail_next_stores(1);
        let journal = journal.with_mirror(Arc::new(mirror));

        assert!(journal.record_run(succeeded("orders_2024", "1")).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_every_record() {
        let (journal, backend) = memory_journal();
        let journal = Arc::new(journal);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let journal = journal.clone();
                tokio::spawn(async move {
                    journal
                        .record_run(succeeded(&format!("entity_{i}"), &i.to_string()))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(backend.snapshot().records.len(), 16);
    }

    #[tokio::test]
    async fn test_open_local_journal() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(&JournalConfig::new(dir.path())).unwrap();
        journal.record_run(succeeded("orders_2024", "7")).await.unwrap();

        let reopened = Journal::open(&JournalConfig::new(dir.path())).unwrap();
        let wm = reopened.get_watermark("orders", "orders_2024").await.unwrap();
        assert_eq!(wm.unwrap().value, "7");
    }

    #[tokio::test]
    async fn test_separate_handles_on_one_workspace_keep_every_record() {
        let dir = TempDir::new().unwrap();
        let config = JournalConfig::new(dir.path());
        let handles = [
            Arc::new(Journal::open(&config).unwrap()),
            Arc::new(Journal::open(&config).unwrap()),
        ];

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let journal = Arc::clone(&handles[i % 2]);
                tokio::spawn(async move {
                    journal
                        .record_run(succeeded(&format!("entity_{i}"), &i.to_string()))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let snapshot = LocalJournalBackend::new(dir.path()).load().await.unwrap();
        assert_eq!(snapshot.records.len(), 20);
    }

    #[test]
    fn test_open_runs() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let records = vec![
            RunRecord::running("f", "e", a),
            RunRecord::running("f", "e", a).succeeded(0, 1, None),
            RunRecord::running("f", "e", b),
        ];
        assert_eq!(open_runs(&records, "f", "e"), vec![b]);
    }
}
