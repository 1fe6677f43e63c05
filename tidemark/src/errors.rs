//! Error types for the tidemark engine.
//!
//! Every failure is classified as either retryable or fatal. The retry
//! policy consults [`TidemarkError::class`] to decide whether an attempt is
//! re-run or the error is propagated immediately.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TidemarkError>;

/// Whether a failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The attempt may be re-run from a clean state.
    Retryable,
    /// The error must propagate without another attempt.
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Which external collaborator raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collaborator {
    /// The data source.
    Home,
    /// The data destination.
    Store,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Home => write!(f, "home"),
            Self::Store => write!(f, "store"),
        }
    }
}

/// The main error type for tidemark operations.
#[derive(Debug, Error)]
pub enum TidemarkError {
    /// Invalid configuration, such as a missing tracked column.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection or authentication failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A transient I/O failure: network blips, lock contention, timeouts.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// The destination is in a state that cannot be trusted.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// The journal could not durably record an outcome.
    #[error("Journal persistence error: {0}")]
    JournalPersistence(String),

    /// The flow was cancelled by its caller.
    #[error("Flow cancelled: {0}")]
    Cancelled(String),

    /// A collaborator reported a failure it considers unrecoverable.
    #[error("Unrecoverable error: {0}")]
    Unrecoverable(String),

    /// A collaborator error annotated with the flow and entity it occurred in.
    #[error("{collaborator} failure in flow '{flow}' (entity '{entity}'): {source}")]
    Collaborator {
        /// The collaborator that failed.
        collaborator: Collaborator,
        /// The flow name.
        flow: String,
        /// The entity name.
        entity: String,
        /// The underlying error.
        #[source]
        source: Box<TidemarkError>,
    },

    /// Every allowed attempt failed.
    #[error("Failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The last error.
        #[source]
        source: Box<TidemarkError>,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TidemarkError {
    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Creates a transient I/O error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo(message.into())
    }

    /// Creates a timeout error for the named operation.
    #[must_use]
    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::TransientIo(format!(
            "{operation} timed out after {}ms",
            after.as_millis()
        ))
    }

    /// Creates a data integrity error.
    #[must_use]
    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::DataIntegrity(message.into())
    }

    /// Creates a journal persistence error.
    #[must_use]
    pub fn journal(message: impl Into<String>) -> Self {
        Self::JournalPersistence(message.into())
    }

    /// Creates an unrecoverable collaborator error.
    #[must_use]
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable(message.into())
    }

    /// Classifies this error for retry decisions.
    ///
    /// Wrapped errors inherit the class of their source. I/O errors are
    /// retryable except for kinds that will not fix themselves on a re-run.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connection(_) | Self::TransientIo(_) => ErrorClass::Retryable,
            Self::Io(err) => match err.kind() {
                std::io::ErrorKind::PermissionDenied
                | std::io::ErrorKind::InvalidInput
                | std::io::ErrorKind::InvalidData
                | std::io::ErrorKind::Unsupported => ErrorClass::Fatal,
                _ => ErrorClass::Retryable,
            },
            Self::Collaborator { source, .. } => source.class(),
            Self::Configuration(_)
            | Self::DataIntegrity(_)
            | Self::JournalPersistence(_)
            | Self::Cancelled(_)
            | Self::Unrecoverable(_)
            | Self::RetriesExhausted { .. }
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Returns true if the error may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Annotates a collaborator error with the flow and entity it came from.
    ///
    /// Errors that already carry context are returned unchanged.
    #[must_use]
    pub fn in_flow(self, collaborator: Collaborator, flow: &str, entity: &str) -> Self {
        match self {
            already @ Self::Collaborator { .. } => already,
            other => Self::Collaborator {
                collaborator,
                flow: flow.to_string(),
                entity: entity.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, unwrapping context and retry annotations.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Collaborator { source, .. } | Self::RetriesExhausted { source, .. } => {
                source.root()
            }
            other => other,
        }
    }

    /// A short stable name for the error kind, used in journal records and events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Self::Configuration(_) => "configuration",
            Self::Connection(_) => "connection",
            Self::TransientIo(_) | Self::Io(_) => "transient_io",
            Self::DataIntegrity(_) => "data_integrity",
            Self::JournalPersistence(_) => "journal_persistence",
            Self::Cancelled(_) => "cancelled",
            Self::Unrecoverable(_) => "unrecoverable",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) | Self::Collaborator { .. } | Self::RetriesExhausted { .. } => {
                "internal"
            }
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind()));
        map.insert("class".to_string(), serde_json::json!(self.class().to_string()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::Collaborator {
                collaborator,
                flow,
                entity,
                ..
            } => {
                map.insert("collaborator".to_string(), serde_json::json!(collaborator.to_string()));
                map.insert("flow".to_string(), serde_json::json!(flow));
                map.insert("entity".to_string(), serde_json::json!(entity));
            }
            Self::RetriesExhausted { attempts, .. } => {
                map.insert("attempts".to_string(), serde_json::json!(attempts));
            }
            _ => {}
        }

        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_classification() {
        assert_eq!(TidemarkError::configuration("x").class(), ErrorClass::Fatal);
        assert_eq!(TidemarkError::connection("x").class(), ErrorClass::Retryable);
        assert_eq!(TidemarkError::transient("x").class(), ErrorClass::Retryable);
        assert_eq!(TidemarkError::data_integrity("x").class(), ErrorClass::Fatal);
        assert_eq!(TidemarkError::journal("x").class(), ErrorClass::Fatal);
        assert_eq!(TidemarkError::unrecoverable("x").class(), ErrorClass::Fatal);
        assert_eq!(
            TidemarkError::Cancelled("stop".to_string()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = TidemarkError::timeout("home.read_batches", Duration::from_millis(250));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_io_error_classification() {
        let blip = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(TidemarkError::from(blip).is_retryable());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(!TidemarkError::from(denied).is_retryable());
    }

    #[test]
    fn test_context_inherits_class() {
        let err = TidemarkError::transient("socket closed").in_flow(
            Collaborator::Home,
            "orders",
            "orders_2024",
        );
        assert!(err.is_retryable());
        assert!(err.to_string().contains("flow 'orders'"));
        assert!(err.to_string().contains("entity 'orders_2024'"));
        assert_eq!(err.kind(), "transient_io");
    }

    #[test]
    fn test_context_is_not_nested_twice() {
        let err = TidemarkError::unrecoverable("gone")
            .in_flow(Collaborator::Store, "a", "b")
            .in_flow(Collaborator::Home, "c", "d");

        match err {
            TidemarkError::Collaborator {
                collaborator, flow, ..
            } => {
                assert_eq!(collaborator, Collaborator::Store);
                assert_eq!(flow, "a");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exhausted_to_dict() {
        let err = TidemarkError::RetriesExhausted {
            attempts: 3,
            source: Box::new(TidemarkError::transient("blip")),
        };

        assert!(!err.is_retryable());
        let dict = err.to_dict();
        assert_eq!(dict.get("attempts").unwrap(), 3);
        assert_eq!(dict.get("kind").unwrap(), "transient_io");
        assert_eq!(dict.get("class").unwrap(), "fatal");
    }
}
