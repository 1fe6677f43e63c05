//! Testing utilities for tidemark flows.
//!
//! This module provides:
//! - In-memory Home and Store adapters with scripted failures
//! - A Home reading through a connection pool
//! - A staging backend wrapper that fails or stalls a chosen promotion
//! - Batch fixtures

mod fixtures;
mod mocks;
mod pooled;
mod staging;

pub use fixtures::{integer_batches, memory_journal, timestamp_batches};
pub use mocks::{MemoryHome, MemoryStore};
pub use pooled::{MemoryConnector, MemorySession, PooledHome, StaticCredentials};
pub use staging::FailingStagingBackend;
