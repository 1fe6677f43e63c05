//! In-memory Home and Store adapters.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::batch::{Batch, Schema};
use crate::errors::{Result, TidemarkError};
use crate::flow::{BatchStream, Home, LowerBound, RunContext, RunType, Store};
use crate::watermark::to_watermark_value;

/// Fails the `batch`-th item (1-based) for the next `remaining` calls.
#[derive(Debug, Clone, Copy)]
struct ScriptedFailure {
    batch: usize,
    remaining: u32,
}

impl ScriptedFailure {
    /// Consumes one failure if `index` is the scripted batch.
    fn fire(slot: &mut Option<Self>, index: usize) -> bool {
        match slot {
            Some(failure) if failure.batch == index && failure.remaining > 0 => {
                failure.remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// A Home serving fixed batches, filtered by the lower bound it is given.
///
/// Rows whose tracked column is null, missing or not above the bound are
/// dropped; batches left empty are skipped.
#[derive(Debug)]
pub struct MemoryHome {
    schema: Schema,
    batches: Vec<Batch>,
    read_failure: Mutex<Option<ScriptedFailure>>,
    lower_bounds: Arc<Mutex<Vec<Option<LowerBound>>>>,
    schema_calls: Mutex<usize>,
}

impl MemoryHome {
    /// Creates a home serving `batches` under `schema`.
    #[must_use]
    pub fn new(schema: Schema, batches: Vec<Batch>) -> Self {
        Self {
            schema,
            batches,
            read_failure: Mutex::new(None),
            lower_bounds: Arc::new(Mutex::new(Vec::new())),
            schema_calls: Mutex::new(0),
        }
    }

    /// Replaces batch `batch` (1-based) with a transient error on the next
    /// `times` reads.
    #[must_use]
    pub fn fail_on_batch(self, batch: usize, times: u32) -> Self {
        *self.read_failure.lock() = Some(ScriptedFailure {
            batch,
            remaining: times,
        });
        self
    }

    /// The lower bound passed to each `read_batches` call, shared so it can
    /// be inspected after the home was moved into a flow.
    #[must_use]
    pub fn lower_bounds(&self) -> Arc<Mutex<Vec<Option<LowerBound>>>> {
        Arc::clone(&self.lower_bounds)
    }

    /// Returns the number of `get_schema` calls.
    #[must_use]
    pub fn schema_calls(&self) -> usize {
        *self.schema_calls.lock()
    }

    fn filter(batch: &Batch, bound: &LowerBound) -> Batch {
        batch
            .rows()
            .iter()
            .filter(|row| {
                row.get(&bound.column)
                    .and_then(to_watermark_value)
                    .is_some_and(|v| bound.admits(&v))
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Home for MemoryHome {
    async fn get_schema(&self) -> Result<Schema> {
        *self.schema_calls.lock() += 1;
        Ok(self.schema.clone())
    }

    async fn read_batches(&self, lower_bound: Option<LowerBound>) -> Result<BatchStream> {
        self.lower_bounds.lock().push(lower_bound.clone());

        let mut failure = self.read_failure.lock();
        let mut items: Vec<Result<Batch>> = Vec::new();
        for (i, batch) in self.batches.iter().enumerate() {
            if ScriptedFailure::fire(&mut failure, i + 1) {
                items.push(Err(TidemarkError::transient(format!(
                    "scripted read failure on batch {}",
                    i + 1
                ))));
                break;
            }
            let batch = match &lower_bound {
                Some(bound) => Self::filter(batch, bound),
                None => batch.clone(),
            };
            if !batch.is_empty() {
                items.push(Ok(batch));
            }
        }

        Ok(futures::stream::iter(items).boxed())
    }
}

#[derive(Debug, Default)]
struct StoreState {
    committed: Vec<Batch>,
    staged: Vec<Batch>,
    contexts: Vec<RunContext>,
    run_type: RunType,
    writes_in_attempt: usize,
    cleanups: usize,
    write_failure: Option<ScriptedFailure>,
    finish_failures: u32,
}

/// A Store keeping staged and committed batches in memory.
///
/// Clones share state, so a test can keep one handle while the flow owns
/// another. Full runs replace the committed batches; incremental runs
/// append to them.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the `batch`-th write (1-based) of an attempt with a transient
    /// error, for the next `times` attempts that reach it.
    #[must_use]
    pub fn fail_on_batch(self, batch: usize, times: u32) -> Self {
        self.state.lock().write_failure = Some(ScriptedFailure {
            batch,
            remaining: times,
        });
        self
    }

    /// Fails the next `times` calls to `finish`.
    #[must_use]
    pub fn fail_on_finish(self, times: u32) -> Self {
        self.state.lock().finish_failures = times;
        self
    }

    /// Batches committed so far, in order.
    #[must_use]
    pub fn committed(&self) -> Vec<Batch> {
        self.state.lock().committed.clone()
    }

    /// Total committed rows.
    #[must_use]
    pub fn committed_rows(&self) -> u64 {
        self.state
            .lock()
            .committed
            .iter()
            .map(|b| b.row_count() as u64)
            .sum()
    }

    /// Batches written by the current attempt and not yet committed.
    #[must_use]
    pub fn staged(&self) -> Vec<Batch> {
        self.state.lock().staged.clone()
    }

    /// The context of every `configure_for_run` call.
    #[must_use]
    pub fn contexts(&self) -> Vec<RunContext> {
        self.state.lock().contexts.clone()
    }

    /// Returns the number of `cleanup_staging` calls.
    #[must_use]
    pub fn cleanup_count(&self) -> usize {
        self.state.lock().cleanups
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn configure_for_run(&mut self, ctx: &RunContext) -> Result<()> {
        let mut state = self.state.lock();
        state.staged.clear();
        state.writes_in_attempt = 0;
        state.run_type = ctx.run_type;
        state.contexts.push(ctx.clone());
        Ok(())
    }

    async fn write(&mut self, batch: &Batch) -> Result<()> {
        let mut state = self.state.lock();
        state.writes_in_attempt += 1;
        let index = state.writes_in_attempt;
        if ScriptedFailure::fire(&mut state.write_failure, index) {
            return Err(TidemarkError::transient(format!(
                "scripted write failure on batch {index}"
            )));
        }
        state.staged.push(batch.clone());
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.finish_failures > 0 {
            state.finish_failures -= 1;
            return Err(TidemarkError::transient("scripted commit failure"));
        }
        let staged = std::mem::take(&mut state.staged);
        match state.run_type {
            RunType::Full => state.committed = staged,
            RunType::Incremental => state.committed.extend(staged),
        }
        Ok(())
    }

    async fn cleanup_staging(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.cleanups += 1;
        state.staged.clear();
        state.writes_in_attempt = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{row, ColumnType, Value};
    use crate::watermark::WatermarkValue;
    use futures::TryStreamExt;
    use uuid::Uuid;

    fn home() -> MemoryHome {
        let batches = vec![
            vec![row([("id", Value::from(1))]), row([("id", Value::from(2))])],
            vec![row([("id", Value::Null)]), row([("id", Value::from(3))])],
        ]
        .into_iter()
        .map(|rows| rows.into_iter().collect())
        .collect();
        MemoryHome::new(Schema::new().with_column("id", ColumnType::Integer), batches)
    }

    #[tokio::test]
    async fn test_home_filters_by_lower_bound() {
        let home = home();
        let bound = LowerBound {
            column: "id".to_string(),
            value: WatermarkValue::Integer(2),
        };

        let batches: Vec<Batch> = home
            .read_batches(Some(bound.clone()))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].row_count(), 1);
        assert_eq!(home.lower_bounds().lock().clone(), vec![Some(bound)]);
    }

    #[tokio::test]
    async fn test_home_scripted_failure_is_consumed() {
        let home = home().fail_on_batch(2, 1);

        let first: Vec<Result<Batch>> = home.read_batches(None).await.unwrap().collect().await;
        assert_eq!(first.len(), 2);
        assert!(first[1].is_err());

        let second: Vec<Batch> = home
            .read_batches(None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_store_commit_semantics() {
        let handle = MemoryStore::new();
        let mut store = handle.clone();
        let batch: Batch = vec![row([("id", Value::from(1))])].into_iter().collect();
        let ctx = |run_type| RunContext {
            flow: "f".to_string(),
            entity: "e".to_string(),
            run_id: Uuid::nil(),
            attempt: 1,
            run_type,
        };

        store.configure_for_run(&ctx(RunType::Incremental)).await.unwrap();
        store.write(&batch).await.unwrap();
        store.finish().await.unwrap();
        store.configure_for_run(&ctx(RunType::Incremental)).await.unwrap();
        store.write(&batch).await.unwrap();
        store.finish().await.unwrap();
        assert_eq!(handle.committed_rows(), 2);

        store.configure_for_run(&ctx(RunType::Full)).await.unwrap();
        store.write(&batch).await.unwrap();
        assert_eq!(handle.staged().len(), 1);
        store.finish().await.unwrap();
        assert_eq!(handle.committed_rows(), 1);
        assert!(handle.staged().is_empty());
    }
}
