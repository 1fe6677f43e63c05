//! # Tidemark
//!
//! An incremental movement engine: moves one entity at a time from a data
//! source ("Home") to a destination ("Store").
//!
//! Tidemark provides:
//!
//! - **Watermark-bounded extraction**: incremental runs read only rows above
//!   the maximum of a tracked column recorded by the last successful run
//! - **Backpressured pipelining**: a bounded queue between a reading
//!   producer task and a writing consumer task
//! - **Two-phase writes**: artifacts are staged privately and promoted only
//!   when the whole attempt succeeded
//! - **Whole-attempt retries**: transient failures roll back the Store and
//!   re-run the attempt from a clean state
//! - **A durable run journal**: outcomes and watermarks rewritten atomically
//! - **Credentialed connection pooling** for adapters
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tidemark::prelude::*;
//!
//! let journal = Arc::new(Journal::open(&JournalConfig::new("/srv/etl"))?);
//! let config = FlowConfig::new("orders", "orders_2024")
//!     .with_run_type(RunType::Incremental)
//!     .with_watermark(WatermarkConfig::new("updated_at", WatermarkType::Timestamp));
//!
//! let registry = AdapterRegistry::with_builtins();
//! let store = registry.create_store(&AdapterSpec::new(
//!     "staged_jsonl",
//!     serde_json::json!({"root": "/srv/lake", "destination": "orders"}),
//! ))?;
//!
//! let mut flow = Flow::new(config, home, store, journal)?;
//! let outcome = flow.run().await?;
//! println!("moved {} rows, watermark {:?}", outcome.rows_moved, outcome.watermark);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod batch;
pub mod cancellation;
pub mod errors;
pub mod events;
pub mod flow;
pub mod journal;
pub mod observability;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod staging;
pub mod testing;
pub mod utils;
pub mod watermark;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{row, Batch, ColumnType, Row, Schema, Value};
    pub use crate::cancellation::CancellationToken;
    pub use crate::errors::{Collaborator, ErrorClass, Result, TidemarkError};
    pub use crate::events::{
        CollectingEventSink, EventKind, EventSink, FlowEvent, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::flow::{
        BatchStream, Flow, FlowConfig, FlowOutcome, FlowState, Home, LowerBound, RunContext,
        RunType, Store,
    };
    pub use crate::journal::{Journal, JournalConfig, RunRecord, RunStatus};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pool::{ConnectionPool, Connector, Credential, CredentialProvider, PoolConfig};
    pub use crate::registry::{AdapterRegistry, AdapterSpec};
    pub use crate::retry::{RetryConfig, RetryPolicy};
    pub use crate::staging::{LocalStagingBackend, StagedBatchStore, StagedWriter};
    pub use crate::watermark::{
        MismatchPolicy, SerializedWatermark, Watermark, WatermarkConfig, WatermarkType,
        WatermarkValue,
    };
}
