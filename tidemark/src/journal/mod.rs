//! Durable journal of run outcomes and watermarks.
//!
//! The journal is one JSON snapshot rewritten atomically on every
//! `record_run`. The watermark of a (flow, entity) pair is the one stored
//! on its most recent succeeded record.

mod backend;
mod ledger;
mod record;

pub use backend::{
    JournalBackend, LocalJournalBackend, MemoryJournalBackend, JOURNAL_FILE, STATE_DIR,
};
pub use ledger::{Journal, JournalConfig, JournalMirror};
pub use record::{JournalSnapshot, RunRecord, RunStatus, SNAPSHOT_VERSION};

#[cfg(test)]
pub use ledger::MockJournalMirror;
