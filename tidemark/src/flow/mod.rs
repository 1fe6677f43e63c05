//! Flow orchestration: Home and Store contracts, configuration, the
//! bounded pipeline and the retrying runner.

mod adapters;
mod config;
mod pipeline;
mod runner;

pub use adapters::{BatchStream, Home, LowerBound, RunContext, RunType, Store};
pub use config::FlowConfig;
pub use runner::{AttemptContext, Flow, FlowOutcome, FlowState};
