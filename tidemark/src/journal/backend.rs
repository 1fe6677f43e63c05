//! Storage backends for the journal snapshot.

use super::record::JournalSnapshot;
use crate::errors::{Result, TidemarkError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Directory under the workspace root holding engine state.
pub const STATE_DIR: &str = ".tidemark";

/// File name of the journal snapshot.
pub const JOURNAL_FILE: &str = "journal.json";

/// Durable storage for the whole journal snapshot.
///
/// `store` must replace the previous snapshot atomically: a reader sees
/// either the old or the new snapshot, never a mix.
#[async_trait]
pub trait JournalBackend: Send + Sync {
    /// Loads the current snapshot, or an empty one if nothing was stored yet.
    async fn load(&self) -> Result<JournalSnapshot>;

    /// Replaces the snapshot.
    async fn store(&self, snapshot: &JournalSnapshot) -> Result<()>;

    /// Human-readable location for logs.
    fn location(&self) -> String;

    /// Lock held across a load-modify-store cycle.
    ///
    /// Backends over shared storage return the same lock for every handle
    /// onto that storage. The default is private to the caller.
    fn write_lock(&self) -> Arc<AsyncMutex<()>> {
        Arc::new(AsyncMutex::new(()))
    }
}

/// Write locks of local snapshots in this process, keyed by snapshot path.
fn local_write_locks() -> &'static DashMap<PathBuf, Arc<AsyncMutex<()>>> {
    static LOCKS: OnceLock<DashMap<PathBuf, Arc<AsyncMutex<()>>>> = OnceLock::new();
    LOCKS.get_or_init(DashMap::new)
}

/// Keeps the snapshot as a JSON file under a workspace root.
#[derive(Debug, Clone)]
pub struct LocalJournalBackend {
    path: PathBuf,
}

impl LocalJournalBackend {
    /// Uses `<root>/.tidemark/journal.json`.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join(STATE_DIR).join(JOURNAL_FILE),
        }
    }

    /// Uses an explicit snapshot path.
    #[must_use]
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let name = format!(".{JOURNAL_FILE}.{}.tmp", Uuid::new_v4().simple());
        self.path.with_file_name(name)
    }

    async fn write_temp(&self, tmp: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Flushes the directory entry created by the rename.
    #[cfg(unix)]
    async fn sync_dir(dir: &Path) -> std::io::Result<()> {
        tokio::fs::File::open(dir).await?.sync_all().await
    }

    #[cfg(not(unix))]
    async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl JournalBackend for LocalJournalBackend {
    async fn load(&self) -> Result<JournalSnapshot> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => JournalSnapshot::from_json(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JournalSnapshot::default()),
            Err(e) => Err(TidemarkError::journal(format!(
                "cannot read journal {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn store(&self, snapshot: &JournalSnapshot) -> Result<()> {
        let bytes = snapshot.to_json()?;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                TidemarkError::journal(format!("cannot create {}: {e}", dir.display()))
            })?;
        }

        let tmp = self.temp_path();
        if let Err(e) = self.write_temp(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(TidemarkError::journal(format!(
                "cannot write {}: {e}",
                tmp.display()
            )));
        }

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(TidemarkError::journal(format!(
                "cannot replace {}: {e}",
                self.path.display()
            )));
        }

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            Self::sync_dir(dir).await.map_err(|e| {
                TidemarkError::journal(format!("cannot sync {}: {e}", dir.display()))
            })?;
        }

        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn write_lock(&self) -> Arc<AsyncMutex<()>> {
        local_write_locks()
            .entry(self.path.clone())
            .or_default()
            .clone()
    }
}

/// Keeps the snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryJournalBackend {
    snapshot: Mutex<JournalSnapshot>,
    fail_stores: Mutex<u32>,
    write_lock: Arc<AsyncMutex<()>>,
}

impl MemoryJournalBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` stores fail.
    pub fn fail_next_stores(&self, n: u32) {
        *self.fail_stores.lock() = n;
    }

    /// A copy of the stored snapshot.
    #[must_use]
    pub fn snapshot(&self) -> JournalSnapshot {
        self.snapshot.lock().clone()
    }
}

#[async_trait]
impl JournalBackend for MemoryJournalBackend {
    async fn load(&self) -> Result<JournalSnapshot> {
        Ok(self.snapshot.lock().clone())
    }

    async fn store(&self, snapshot: &JournalSnapshot) -> Result<()> {
        {
            let mut failures = self.fail_stores.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(TidemarkError::journal("injected store failure"));
            }
        }
        *self.snapshot.lock() = snapshot.clone();
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }

    fn write_lock(&self) -> Arc<AsyncMutex<()>> {
        Arc::clone(&self.write_lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::RunRecord;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let backend = LocalJournalBackend::new(dir.path());

        let snapshot = backend.load().await.unwrap();
        assert!(snapshot.records.is_empty());
    }

    #[tokio::test]
    async fn test_local_store_replaces_file() {
        let dir = TempDir::new().unwrap();
        let backend = LocalJournalBackend::new(dir.path());

        let mut snapshot = JournalSnapshot::default();
        snapshot
            .records
            .push(RunRecord::running("orders", "orders_2024", Uuid::nil()));
        backend.store(&snapshot).await.unwrap();
        snapshot
            .records
            .push(RunRecord::running("orders", "orders_2025", Uuid::nil()));
        backend.store(&snapshot).await.unwrap();

        assert!(dir.path().join(".tidemark/journal.json").exists());
        assert_eq!(backend.load().await.unwrap().records.len(), 2);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join(STATE_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_local_corrupt_snapshot_is_error() {
        let dir = TempDir::new().unwrap();
        let backend = LocalJournalBackend::new(dir.path());
        std::fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        std::fs::write(backend.path(), b"][").unwrap();

        let err = backend.load().await.unwrap_err();
        assert!(matches!(err, TidemarkError::JournalPersistence(_)));
    }

    #[test]
    fn test_local_handles_on_one_path_share_a_write_lock() {
        let dir = TempDir::new().unwrap();
        let a = LocalJournalBackend::new(dir.path());
        let b = LocalJournalBackend::new(dir.path());
        let other = LocalJournalBackend::at_path(dir.path().join("other.json"));

        assert!(Arc::ptr_eq(&a.write_lock(), &b.write_lock()));
        assert!(!Arc::ptr_eq(&a.write_lock(), &other.write_lock()));
    }

    #[tokio::test]
    async fn test_memory_injected_failure() {
        let backend = MemoryJournalBackend::new();
        backend.fail_next_stores(1);

        let snapshot = JournalSnapshot::default();
        assert!(backend.store(&snapshot).await.is_err());
        assert!(backend.store(&snapshot).await.is_ok());
    }
}
