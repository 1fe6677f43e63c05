//! The flow orchestrator.
//!
//! A [`Flow`] moves one entity from Home to Store. Each attempt reads the
//! schema, binds the watermark filter, runs the pipeline and commits the
//! Store. A retryable failure rolls the Store back, resets the attempt
//! context and re-runs the whole attempt; the final outcome is journaled
//! before it is returned.

use super::adapters::{Home, LowerBound, RunContext, RunType, Store};
use super::config::FlowConfig;
use super::pipeline::{with_timeout, Pipeline, SharedStore};
use crate::cancellation::CancellationToken;
use crate::errors::{Collaborator, Result, TidemarkError};
use crate::events::{EventKind, EventSink, FlowEvent, LoggingEventSink};
use crate::journal::{Journal, RunRecord};
use crate::observability::{flow_span, SpanTimer};
use crate::retry::{Attempt, RetryPolicy};
use crate::utils::new_run_id;
use crate::watermark::{SerializedWatermark, Watermark, WatermarkResolution};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Lifecycle state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Not started.
    Pending,
    /// Attempts in progress.
    Running,
    /// Committed and journaled.
    Succeeded,
    /// Failed and journaled (when the journal was reachable).
    Failed,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowOutcome {
    /// Run identifier.
    pub run_id: Uuid,
    /// Flow name.
    pub flow: String,
    /// Entity name.
    pub entity: String,
    /// Run type.
    pub run_type: RunType,
    /// Rows committed by the successful attempt.
    pub rows_moved: u64,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Watermark recorded for the next run.
    pub watermark: Option<SerializedWatermark>,
    /// Wall time of the whole run.
    pub duration: Duration,
}

/// State owned by the attempt in progress.
///
/// Reset between attempts so a retry starts from the pre-run watermark with
/// zeroed counters.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Identity passed to Store.
    pub run: RunContext,
    /// Watermark tracker, seeded from the journal.
    pub watermark: Option<Watermark>,
    /// Rows written so far.
    pub rows_moved: u64,
    /// Batches written so far.
    pub batches: u64,
    /// The record that will be journaled for this run.
    pub record: RunRecord,
}

impl AttemptContext {
    fn new(config: &FlowConfig, run_id: Uuid) -> Self {
        Self {
            run: RunContext {
                flow: config.flow.clone(),
                entity: config.entity.clone(),
                run_id,
                attempt: 0,
                run_type: config.run_type,
            },
            watermark: None,
            rows_moved: 0,
            batches: 0,
            record: RunRecord::running(config.flow.clone(), config.entity.clone(), run_id),
        }
    }

    /// Restores the pre-attempt state.
    pub fn reset(&mut self) {
        if let Some(wm) = self.watermark.as_mut() {
            wm.reset();
        }
        self.rows_moved = 0;
        self.batches = 0;
    }
}

/// Moves one entity from Home to Store.
pub struct Flow {
    config: FlowConfig,
    home: Arc<dyn Home>,
    store: SharedStore,
    journal: Arc<Journal>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    state: FlowState,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("flow", &self.config.flow)
            .field("entity", &self.config.entity)
            .field("run_type", &self.config.run_type)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Flow {
    /// Creates a flow after validating its config.
    pub fn new(
        config: FlowConfig,
        home: Arc<dyn Home>,
        store: Box<dyn Store>,
        journal: Arc<Journal>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            home,
            store: Arc::new(Mutex::new(store)),
            journal,
            events: Arc::new(LoggingEventSink),
            cancel: Arc::new(CancellationToken::new()),
            state: FlowState::Pending,
        })
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Uses a caller-owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// The token that stops this flow between batches.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    /// The flow config.
    #[must_use]
    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Runs the flow to completion.
    ///
    /// A flow runs once; a second call is a configuration error.
    pub async fn run(&mut self) -> Result<FlowOutcome> {
        if self.state != FlowState::Pending {
            return Err(TidemarkError::configuration(format!(
                "flow '{}' is {}, not pending",
                self.config.flow, self.state
            )));
        }
        self.state = FlowState::Running;

        let run_id = new_run_id();
        let span = flow_span(&self.config.flow, &self.config.entity, run_id);
        let result = self.run_attempts(run_id).instrument(span).await;

        self.state = if result.is_ok() {
            FlowState::Succeeded
        } else {
            FlowState::Failed
        };
        result
    }

    async fn run_attempts(&self, run_id: Uuid) -> Result<FlowOutcome> {
        let timer = SpanTimer::start("flow.run");
        let flow = self.config.flow.as_str();
        let entity = self.config.entity.as_str();

        let prior = self.journal.get_watermark(flow, entity).await?;
        let mut attempt = FlowAttempt {
            config: self.config.clone(),
            home: Arc::clone(&self.home),
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            cancel: Arc::clone(&self.cancel),
            prior: prior.clone(),
            ctx: AttemptContext::new(&self.config, run_id),
            dirty: false,
        };

        self.journal.record_run(attempt.ctx.record.clone()).await?;
        info!(
            run_type = %self.config.run_type,
            prior_watermark = ?prior.as_ref().map(|w| w.value.as_str()),
            "flow started"
        );
        self.emit(FlowEvent::new(EventKind::FlowStarted, flow, entity, run_id, 0).with_data(
            serde_json::json!({
                "run_type": self.config.run_type,
                "prior_watermark": prior,
            }),
        ))
        .await;

        let policy = RetryPolicy::new(self.config.retry.clone());
        let outcome = policy.execute(&mut attempt).await;
        let attempts = attempt.ctx.run.attempt;

        match outcome {
            Ok(()) => {
                let watermark = attempt
                    .ctx
                    .watermark
                    .as_ref()
                    .and_then(Watermark::serialize)
                    .or(prior);
                let rows_moved = attempt.ctx.rows_moved;
                let record = attempt
                    .ctx
                    .record
                    .clone()
                    .succeeded(rows_moved, attempts, watermark.clone());
                self.journal.record_run(record).await?;

                let duration = timer.finish();
                info!(
                    rows = rows_moved,
                    attempts,
                    watermark = ?watermark.as_ref().map(|w| w.value.as_str()),
                    duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    "flow succeeded"
                );
                self.emit(
                    FlowEvent::new(EventKind::FlowSucceeded, flow, entity, run_id, attempts)
                        .with_data(serde_json::json!({
                            "rows_moved": rows_moved,
                            "watermark": watermark,
                        })),
                )
                .await;

                Ok(FlowOutcome {
                    run_id,
                    flow: flow.to_string(),
                    entity: entity.to_string(),
                    run_type: self.config.run_type,
                    rows_moved,
                    attempts,
                    watermark,
                    duration,
                })
            }
            Err(err) => {
                if attempt.dirty {
                    if let Err(rollback_err) = attempt.rollback().await {
                        warn!(error = %rollback_err, "rollback after final failure failed");
                    }
                }

                let record = attempt.ctx.record.clone().failed(attempts, &err);
                if let Err(journal_err) = self.journal.record_run(record).await {
                    return Err(TidemarkError::journal(format!(
                        "{journal_err}; run failed with: {err}"
                    )));
                }

                warn!(attempts, error = %err, kind = err.kind(), "flow failed");
                self.emit(
                    FlowEvent::new(EventKind::FlowFailed, flow, entity, run_id, attempts)
                        .with_data(serde_json::json!({
                            "error": err.to_string(),
                            "kind": err.kind(),
                        })),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn emit(&self, event: FlowEvent) {
        self.events.emit(event).await;
    }
}

/// One attempt of a flow, re-run as a unit by the retry policy.
struct FlowAttempt {
    config: FlowConfig,
    home: Arc<dyn Home>,
    store: SharedStore,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    prior: Option<SerializedWatermark>,
    ctx: AttemptContext,
    /// The Store may hold uncommitted or partially promoted writes.
    dirty: bool,
}

impl FlowAttempt {
    fn home_err(&self, err: TidemarkError) -> TidemarkError {
        err.in_flow(Collaborator::Home, &self.config.flow, &self.config.entity)
    }

    fn store_err(&self, err: TidemarkError) -> TidemarkError {
        err.in_flow(Collaborator::Store, &self.config.flow, &self.config.entity)
    }

    /// Builds the tracker on first use and checks it against the current schema.
    fn bind_watermark(&mut self, schema: &crate::batch::Schema) -> Result<Option<LowerBound>> {
        let Some(wm_config) = self.config.watermark.clone() else {
            return Ok(None);
        };

        if self.ctx.watermark.is_none() {
            let mut wm = Watermark::new(self.config.entity.clone(), wm_config);
            wm.validate_schema(schema)?;
            match wm.resolve_prior(self.prior.as_ref()) {
                WatermarkResolution::Found(value) => wm.seed(value)?,
                WatermarkResolution::NotFound => {}
                WatermarkResolution::SchemaInvalid(reason) => {
                    return Err(TidemarkError::configuration(format!(
                        "journaled watermark for '{}' is unusable: {reason}",
                        self.config.entity
                    )));
                }
            }
            self.ctx.watermark = Some(wm);
        }

        let Some(wm) = self.ctx.watermark.as_ref() else {
            return Ok(None);
        };
        wm.validate_schema(schema)?;

        if self.config.run_type != RunType::Incremental {
            return Ok(None);
        }
        Ok(wm.seed_value().map(|value| LowerBound {
            column: wm.column().to_string(),
            value: value.clone(),
        }))
    }

    async fn run_once(&mut self) -> Result<()> {
        self.cancel.check()?;
        let io_timeout = self.config.io_timeout();

        let schema = with_timeout("home.get_schema", io_timeout, self.home.get_schema())
            .await
            .map_err(|e| self.home_err(e))?;
        let lower_bound = self.bind_watermark(&schema)?;
        info!(
            attempt = self.ctx.run.attempt,
            lower_bound = ?lower_bound.as_ref().map(|b| b.value.to_string()),
            "attempt started"
        );

        {
            let mut store = self.store.lock().await;
            with_timeout(
                "store.configure_for_run",
                io_timeout,
                store.configure_for_run(&self.ctx.run),
            )
            .await
            .map_err(|e| self.store_err(e))?;
        }

        let pipeline = Pipeline {
            home: Arc::clone(&self.home),
            store: Arc::clone(&self.store),
            cancel: Arc::clone(&self.cancel),
            flow: self.config.flow.clone(),
            entity: self.config.entity.clone(),
            capacity: self.config.queue_capacity,
            io_timeout,
        };
        let output = pipeline
            .run(lower_bound, self.ctx.watermark.clone())
            .await?;
        self.ctx.rows_moved = output.rows;
        self.ctx.batches = output.batches;
        if output.watermark.is_some() {
            self.ctx.watermark = output.watermark;
        }

        self.cancel.check()?;
        {
            let mut store = self.store.lock().await;
            // an interrupted commit may be partially applied, so it is never retried
            let finished = tokio::time::timeout(io_timeout, store.finish())
                .await
                .unwrap_or_else(|_| {
                    Err(TidemarkError::data_integrity(format!(
                        "store.finish timed out after {}ms; commit may be partially applied",
                        io_timeout.as_millis()
                    )))
                });
            finished.map_err(|e| self.store_err(e))?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let io_timeout = self.config.io_timeout();
        let result = {
            let mut store = self.store.lock().await;
            with_timeout("store.cleanup_staging", io_timeout, store.cleanup_staging()).await
        };
        self.ctx.reset();
        self.dirty = false;
        result.map_err(|e| self.store_err(e))
    }

    async fn emit(&self, kind: EventKind, data: serde_json::Value) {
        let event = FlowEvent::new(
            kind,
            self.config.flow.clone(),
            self.config.entity.clone(),
            self.ctx.run.run_id,
            self.ctx.run.attempt,
        )
        .with_data(data);
        self.events.emit(event).await;
    }
}

#[async_trait]
impl Attempt for FlowAttempt {
    type Output = ();

    async fn run(&mut self, attempt: u32) -> Result<()> {
        self.ctx.run.attempt = attempt;
        self.dirty = true;
        let timer = SpanTimer::start("flow.attempt");

        let result = self.run_once().await;
        let elapsed = timer.finish();

        match &result {
            Ok(()) => {
                self.dirty = false;
                info!(
                    attempt,
                    rows = self.ctx.rows_moved,
                    batches = self.ctx.batches,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "attempt committed"
                );
            }
            Err(err) => {
                warn!(attempt, error = %err, class = %err.class(), "attempt failed");
                self.emit(
                    EventKind::AttemptFailed,
                    serde_json::json!({
                        "error": err.to_string(),
                        "kind": err.kind(),
                        "class": err.class(),
                    }),
                )
                .await;
            }
        }
        result
    }

    async fn cleanup(&mut self, error: &TidemarkError) -> Result<()> {
        self.rollback().await?;
        info!(attempt = self.ctx.run.attempt, "attempt rolled back");
        self.emit(
            EventKind::RolledBack,
            serde_json::json!({ "cause": error.to_string() }),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{row, Batch, ColumnType, Schema, Value};
    use crate::events::CollectingEventSink;
    use crate::journal::{MemoryJournalBackend, RunStatus};
    use crate::retry::RetryConfig;
    use crate::testing::{MemoryHome, MemoryStore};
    use crate::watermark::{WatermarkConfig, WatermarkType};

    fn id_batches(ranges: &[(i64, i64)]) -> Vec<Batch> {
        ranges
            .iter()
            .map(|(lo, hi)| (*lo..=*hi).map(|i| row([("id", Value::from(i))])).collect())
            .collect()
    }

    fn schema() -> Schema {
        Schema::new().with_column("id", ColumnType::Integer)
    }

    fn config() -> FlowConfig {
        FlowConfig::new("orders", "orders_2024")
            .with_run_type(RunType::Incremental)
            .with_watermark(WatermarkConfig::new("id", WatermarkType::Integer))
            .with_retry(RetryConfig::new().with_base_delay_ms(1).with_max_delay_ms(2))
    }

    fn journal() -> Arc<Journal> {
        Arc::new(Journal::new(Arc::new(MemoryJournalBackend::new())))
    }

    #[tokio::test]
    async fn test_successful_run_journals_watermark() {
        let journal = journal();
        let home = MemoryHome::new(schema(), id_batches(&[(1, 3), (4, 6)]));
        let store = MemoryStore::new();
        let events = Arc::new(CollectingEventSink::new());

        let mut flow = Flow::new(config(), Arc::new(home), Box::new(store.clone()), Arc::clone(&journal))
            .unwrap()
            .with_event_sink(events.clone());
        let outcome = flow.run().await.unwrap();

        assert_eq!(flow.state(), FlowState::Succeeded);
        assert_eq!(outcome.rows_moved, 6);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.watermark.as_ref().unwrap().value, "6");
        assert_eq!(store.committed_rows(), 6);
        assert_eq!(
            events.kinds(),
            vec![EventKind::FlowStarted, EventKind::FlowSucceeded]
        );

        let latest = journal.latest("orders", "orders_2024").await.unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Succeeded);
        assert_eq!(latest.run_id, outcome.run_id);
    }

    #[tokio::test]
    async fn test_second_incremental_run_reads_above_watermark() {
        let journal = journal();
        let batches = id_batches(&[(1, 5), (6, 10)]);

        let mut first = Flow::new(
            config(),
            Arc::new(MemoryHome::new(schema(), batches.clone())),
            Box::new(MemoryStore::new()),
            Arc::clone(&journal),
        )
        .unwrap();
        first.run().await.unwrap();

        let home = MemoryHome::new(schema(), batches);
        let bounds = home.lower_bounds();
        let mut second = Flow::new(config(), Arc::new(home), Box::new(MemoryStore::new()), journal)
            .unwrap();
        let outcome = second.run().await.unwrap();

        assert_eq!(outcome.rows_moved, 0);
        assert_eq!(outcome.watermark.unwrap().value, "10");
        assert_eq!(bounds.lock()[0].as_ref().unwrap().value.to_string(), "10");
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let mut flow = Flow::new(
            config(),
            Arc::new(MemoryHome::new(schema(), vec![])),
            Box::new(MemoryStore::new()),
            journal(),
        )
        .unwrap();
        flow.run().await.unwrap();
        assert!(matches!(flow.run().await, Err(TidemarkError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_journaled() {
        let journal = journal();
        let store = MemoryStore::new().fail_on_batch(1, u32::MAX);
        let events = Arc::new(CollectingEventSink::new());

        let mut flow = Flow::new(
            config(),
            Arc::new(MemoryHome::new(schema(), id_batches(&[(1, 2)]))),
            Box::new(store.clone()),
            Arc::clone(&journal),
        )
        .unwrap()
        .with_event_sink(events.clone());

        let err = flow.run().await.unwrap_err();
        assert!(matches!(err, TidemarkError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(flow.state(), FlowState::Failed);
        assert_eq!(store.cleanup_count(), 3);
        assert_eq!(events.of_kind(EventKind::AttemptFailed).len(), 3);
        assert_eq!(events.of_kind(EventKind::RolledBack).len(), 2);

        let latest = journal.latest("orders", "orders_2024").await.unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Failed);
        assert_eq!(latest.attempts, 3);
        assert_eq!(latest.error_kind.as_deref(), Some("transient_io"));
        assert_eq!(journal.get_watermark("orders", "orders_2024").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unusable_journaled_watermark_is_fatal() {
        let journal = journal();
        let run_id = new_run_id();
        journal
            .record_run(RunRecord::running("orders", "orders_2024", run_id).succeeded(
                1,
                1,
                Some(SerializedWatermark::new("2024-05-01T00:00:00.000000Z", WatermarkType::Timestamp)),
            ))
            .await
            .unwrap();

        let home = MemoryHome::new(schema(), id_batches(&[(1, 2)]));
        let reads = home.lower_bounds();
        let mut flow = Flow::new(config(), Arc::new(home), Box::new(MemoryStore::new()), journal)
            .unwrap();

        let err = flow.run().await.unwrap_err();
        assert!(matches!(err, TidemarkError::Configuration(_)));
        assert!(reads.lock().is_empty());
    }
}
