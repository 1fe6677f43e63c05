//! Retry handling for whole flow attempts.
//!
//! A failed attempt is classified as retryable or fatal. Retryable failures
//! run the attempt's cleanup hook, back off, and re-run the attempt from
//! scratch.

mod config;
mod policy;

pub use config::{BackoffStrategy, JitterStrategy, RetryConfig, RetryState};
pub use policy::{Attempt, Classifier, RetryPolicy};
