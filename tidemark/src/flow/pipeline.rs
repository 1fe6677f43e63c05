//! Bounded producer/consumer pipeline between Home and Store.
//!
//! The producer pulls batches from Home into a bounded FIFO queue and
//! finishes with [`QueueItem::End`]. The single consumer writes each batch
//! to Store and folds it into the attempt's watermark in production order.
//! When either side fails, the other is aborted and awaited before the
//! error is returned.

use super::adapters::{Home, LowerBound, Store};
use crate::batch::Batch;
use crate::cancellation::CancellationToken;
use crate::errors::{Collaborator, Result, TidemarkError};
use crate::watermark::Watermark;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, trace};

/// A Store shared between the runner and the consumer task.
pub(crate) type SharedStore = Arc<Mutex<Box<dyn Store>>>;

/// Runs `future` under `limit`; expiry is a retryable timeout.
pub(crate) async fn with_timeout<T, F>(operation: &str, limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, future)
        .await
        .unwrap_or_else(|_| Err(TidemarkError::timeout(operation, limit)))
}

/// What travels through the queue.
#[derive(Debug)]
pub(crate) enum QueueItem {
    Batch(Batch),
    End,
}

/// Why a pipeline task stopped early.
#[derive(Debug)]
enum TaskFailure {
    /// The task itself failed.
    Error(TidemarkError),
    /// The other side of the queue went away first.
    PeerGone,
}

impl From<TidemarkError> for TaskFailure {
    fn from(err: TidemarkError) -> Self {
        Self::Error(err)
    }
}

/// Totals of a completed pipeline.
#[derive(Debug)]
pub(crate) struct PipelineOutput {
    pub rows: u64,
    pub batches: u64,
    pub watermark: Option<Watermark>,
}

/// One pipeline run for one attempt.
pub(crate) struct Pipeline {
    pub home: Arc<dyn Home>,
    pub store: SharedStore,
    pub cancel: Arc<CancellationToken>,
    pub flow: String,
    pub entity: String,
    pub capacity: usize,
    pub io_timeout: Duration,
}

impl Pipeline {
    /// Moves every batch above `lower_bound` from Home to Store.
    ///
    /// `watermark` is folded by the consumer and handed back on success.
    pub(crate) async fn run(
        self,
        lower_bound: Option<LowerBound>,
        watermark: Option<Watermark>,
    ) -> Result<PipelineOutput> {
        let (tx, rx) = mpsc::channel(self.capacity.max(1));

        let mut producer = tokio::spawn(produce(
            Arc::clone(&self.home),
            Arc::clone(&self.cancel),
            tx,
            lower_bound,
            self.io_timeout,
            self.flow.clone(),
            self.entity.clone(),
        ));
        let mut consumer = tokio::spawn(consume(
            Arc::clone(&self.store),
            Arc::clone(&self.cancel),
            rx,
            watermark,
            self.io_timeout,
            self.flow.clone(),
            self.entity.clone(),
        ));

        tokio::select! {
            produced = &mut producer => match flatten(produced) {
                Ok(()) => match flatten(consumer.await) {
                    Ok(output) => Ok(output),
                    Err(TaskFailure::Error(err)) => Err(err),
                    Err(TaskFailure::PeerGone) => Err(TidemarkError::Internal(
                        "queue closed before the end of the stream".to_string(),
                    )),
                },
                Err(TaskFailure::Error(err)) => {
                    stop(consumer).await;
                    Err(err)
                }
                Err(TaskFailure::PeerGone) => match flatten(consumer.await) {
                    Err(TaskFailure::Error(err)) => Err(err),
                    _ => Err(TidemarkError::Internal(
                        "consumer stopped before the end of the stream".to_string(),
                    )),
                },
            },
            consumed = &mut consumer => match flatten(consumed) {
                Ok(output) => match flatten(producer.await) {
                    Err(TaskFailure::Error(err)) => Err(err),
                    _ => Ok(output),
                },
                Err(TaskFailure::Error(err)) => {
                    stop(producer).await;
                    Err(err)
                }
                Err(TaskFailure::PeerGone) => match flatten(producer.await) {
                    Err(TaskFailure::Error(err)) => Err(err),
                    _ => Err(TidemarkError::Internal(
                        "producer stopped without signalling the end of the stream".to_string(),
                    )),
                },
            },
        }
    }
}

fn flatten<T>(
    joined: std::result::Result<std::result::Result<T, TaskFailure>, JoinError>,
) -> std::result::Result<T, TaskFailure> {
    joined.unwrap_or_else(|e| {
        Err(TaskFailure::Error(TidemarkError::Internal(format!(
            "pipeline task failed: {e}"
        ))))
    })
}

async fn stop<T>(handle: JoinHandle<T>) {
    handle.abort();
    let _ = handle.await;
}

async fn produce(
    home: Arc<dyn Home>,
    cancel: Arc<CancellationToken>,
    tx: mpsc::Sender<QueueItem>,
    lower_bound: Option<LowerBound>,
    io_timeout: Duration,
    flow: String,
    entity: String,
) -> std::result::Result<(), TaskFailure> {
    let in_flow = |e: TidemarkError| e.in_flow(Collaborator::Home, &flow, &entity);

    let mut stream = with_timeout("home.read_batches", io_timeout, home.read_batches(lower_bound))
        .await
        .map_err(in_flow)?;

    let mut produced: u64 = 0;
    loop {
        cancel.check()?;

        let next = tokio::time::timeout(io_timeout, stream.next())
            .await
            .map_err(|_| in_flow(TidemarkError::timeout("home.next_batch", io_timeout)))?;

        let Some(batch) = next else {
            break;
        };
        let batch = batch.map_err(in_flow)?;
        produced += 1;
        trace!(batch = produced, rows = batch.row_count(), "batch read");

        if tx.send(QueueItem::Batch(batch)).await.is_err() {
            return Err(TaskFailure::PeerGone);
        }
    }

    debug!(batches = produced, "home exhausted");
    tx.send(QueueItem::End)
        .await
        .map_err(|_| TaskFailure::PeerGone)
}

async fn consume(
    store: SharedStore,
    cancel: Arc<CancellationToken>,
    mut rx: mpsc::Receiver<QueueItem>,
    mut watermark: Option<Watermark>,
    io_timeout: Duration,
    flow: String,
    entity: String,
) -> std::result::Result<PipelineOutput, TaskFailure> {
    let mut rows: u64 = 0;
    let mut batches: u64 = 0;

    loop {
        let batch = match rx.recv().await {
            Some(QueueItem::Batch(batch)) => batch,
            Some(QueueItem::End) => break,
            None => return Err(TaskFailure::PeerGone),
        };
        cancel.check()?;

        {
            let mut store = store.lock().await;
            with_timeout("store.write", io_timeout, store.write(&batch))
                .await
                .map_err(|e| e.in_flow(Collaborator::Store, &flow, &entity))?;
        }

        if let Some(wm) = watermark.as_mut() {
            wm.update(&batch)?;
        }

        batches += 1;
        rows += batch.row_count() as u64;
        trace!(batch = batches, rows = batch.row_count(), "batch written");
    }

    debug!(batches, rows, "store drained queue");
    Ok(PipelineOutput {
        rows,
        batches,
        watermark,
    })
}
