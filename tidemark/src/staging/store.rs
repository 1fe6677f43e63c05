//! A Store that writes JSON-lines part files through a [`StagedWriter`].

use super::backend::StagingBackend;
use super::writer::{StagedWriter, StagingScope};
use crate::batch::Batch;
use crate::errors::{Result, TidemarkError};
use crate::flow::{RunContext, RunType, Store};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Writes every batch as one `part-*.jsonl` file and promotes them on `finish`.
///
/// Full runs replace the destination prefix; incremental runs add new part
/// files next to the existing ones.
#[derive(Debug)]
pub struct StagedBatchStore {
    writer: StagedWriter,
    run_id: Option<Uuid>,
    parts: u32,
    rows_staged: u64,
}

impl StagedBatchStore {
    /// Creates a store promoting into `destination` on `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn StagingBackend>, destination: impl Into<String>) -> Self {
        Self {
            writer: StagedWriter::new(backend, destination),
            run_id: None,
            parts: 0,
            rows_staged: 0,
        }
    }

    /// The underlying staged writer.
    #[must_use]
    pub fn writer(&self) -> &StagedWriter {
        &self.writer
    }

    /// Rows written in the current attempt.
    #[must_use]
    pub fn rows_staged(&self) -> u64 {
        self.rows_staged
    }

    fn encode(batch: &Batch) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for row in batch.rows() {
            serde_json::to_writer(&mut out, row)?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for StagedBatchStore {
    async fn configure_for_run(&mut self, ctx: &RunContext) -> Result<()> {
        self.writer
            .set_replace_destination(ctx.run_type == RunType::Full);
        self.writer
            .begin(StagingScope::new(
                ctx.flow.clone(),
                ctx.entity.clone(),
                ctx.run_id,
                ctx.attempt,
            ))
            .await?;
        self.run_id = Some(ctx.run_id);
        self.parts = 0;
        self.rows_staged = 0;
        Ok(())
    }

    async fn write(&mut self, batch: &Batch) -> Result<()> {
        let Some(run_id) = self.run_id else {
            return Err(TidemarkError::Internal(
                "write called before configure_for_run".to_string(),
            ));
        };
        if batch.is_empty() {
            return Ok(());
        }

        self.parts += 1;
        let relative = format!("part-{}-{:05}.jsonl", run_id.simple(), self.parts);
        let key = self.writer.stage(&relative)?;
        let bytes = Self::encode(batch)?;
        self.writer.backend().write(&key, &bytes).await?;
        self.rows_staged += batch.row_count() as u64;

        debug!(key = %key, rows = batch.row_count(), "batch staged");
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.writer.commit().await?;
        self.run_id = None;
        Ok(())
    }

    async fn cleanup_staging(&mut self) -> Result<()> {
        self.rows_staged = 0;
        self.parts = 0;
        self.writer.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{row, Value};
    use crate::staging::LocalStagingBackend;
    use tempfile::TempDir;

    fn ctx(run_type: RunType, attempt: u32) -> RunContext {
        RunContext {
            flow: "orders".to_string(),
            entity: "orders_2024".to_string(),
            run_id: Uuid::nil(),
            attempt,
            run_type,
        }
    }

    fn batch(ids: &[i64]) -> Batch {
        ids.iter().map(|id| row([("id", Value::from(*id))])).collect()
    }

    #[tokio::test]
    async fn test_stage_and_commit_parts() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalStagingBackend::new(dir.path()));
        let mut store = StagedBatchStore::new(backend.clone(), "out/orders");

        store.configure_for_run(&ctx(RunType::Full, 1)).await.unwrap();
        store.write(&batch(&[1, 2])).await.unwrap();
        store.write(&batch(&[])).await.unwrap();
        store.write(&batch(&[3])).await.unwrap();
        assert_eq!(store.rows_staged(), 3);
        assert!(backend.list("out").await.unwrap().is_empty());

        store.finish().await.unwrap();
        let parts = backend.list("out/orders").await.unwrap();
        assert_eq!(parts.len(), 2);

        let first = String::from_utf8(backend.read(&parts[0]).await.unwrap()).unwrap();
        assert_eq!(first.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_discards_attempt() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalStagingBackend::new(dir.path()));
        let mut store = StagedBatchStore::new(backend.clone(), "out/orders");

        store.configure_for_run(&ctx(RunType::Incremental, 1)).await.unwrap();
        store.write(&batch(&[1])).await.unwrap();
        store.cleanup_staging().await.unwrap();
        assert!(backend.list("_staging").await.unwrap().is_empty());

        store.configure_for_run(&ctx(RunType::Incremental, 2)).await.unwrap();
        store.write(&batch(&[1])).await.unwrap();
        store.finish().await.unwrap();
        assert_eq!(backend.list("out/orders").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_write_before_configure_fails() {
        let dir = TempDir::new().unwrap();
        let mut store =
            StagedBatchStore::new(Arc::new(LocalStagingBackend::new(dir.path())), "out");
        assert!(store.write(&batch(&[1])).await.is_err());
    }
}
