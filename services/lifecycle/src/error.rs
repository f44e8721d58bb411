//! Error types for the lifecycle service.
//!
//! Provider calls fail with [`StorageError`], lookups with [`RegistryError`],
//! policy parsing with [`PolicyError`]. [`LifecycleError`] is what an
//! operation body produces internally; it never crosses an operation
//! boundary, where it is folded into the operation's result type instead.

use thiserror::Error;

/// Errors raised by a storage provider
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error in {provider}: {message}")]
    Backend { provider: String, message: String },

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid criteria: {0}")]
    InvalidCriteria(String),

    #[error("Record {id} in table {table} is malformed: {reason}")]
    MalformedRecord {
        table: String,
        id: String,
        reason: String,
    },
}

impl StorageError {
    /// Build a backend error tagged with the provider that raised it
    pub fn backend(provider: impl Into<String>, message: impl ToString) -> Self {
        Self::Backend {
            provider: provider.into(),
            message: message.to_string(),
        }
    }
}

/// Errors raised while resolving providers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No provider serves tier {0}")]
    NoProviderForTier(String),

    #[error("No provider is routed for table {0}")]
    NoProviderForTable(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("No archive provider is configured")]
    NoArchiveProvider,

    #[error("Provider {0} is registered twice")]
    DuplicateProvider(String),
}

/// Errors raised while parsing policy and schedule configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Invalid age threshold '{0}', expected '<amount>_<unit>'")]
    InvalidAge(String),

    #[error("Unsupported time unit '{0}'")]
    UnsupportedUnit(String),

    #[error("Invalid condition '{0}'")]
    InvalidCondition(String),

    #[error("Invalid schedule '{0}'")]
    InvalidSchedule(String),

    #[error("Rule {index} of policy {policy} has neither an age nor a condition")]
    UnboundedRule { policy: String, index: usize },
}

/// Errors produced inside a lifecycle operation
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("Operation {0} was cancelled")]
    Cancelled(String),

    #[error("Operation {0} is already in flight")]
    DuplicateOperation(String),

    #[error("Archival of table {table} failed: {message}")]
    Archival { table: String, message: String },

    #[error("Failed after {processed} records: {source}")]
    PartialProgress {
        processed: u64,
        #[source]
        source: Box<LifecycleError>,
    },
}

impl LifecycleError {
    /// Records that were durably handled before the failure, if any
    pub fn processed(&self) -> u64 {
        match self {
            Self::PartialProgress { processed, .. } => *processed,
            _ => 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled(_) => true,
            Self::PartialProgress { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_progress_reports_count() {
        let err = LifecycleError::PartialProgress {
            processed: 42,
            source: Box::new(StorageError::backend("pg", "connection reset").into()),
        };

        assert_eq!(err.processed(), 42);
        assert!(!err.is_cancelled());
        assert!(err.to_string().contains("42 records"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_cancellation_seen_through_partial_progress() {
        let err = LifecycleError::PartialProgress {
            processed: 3,
            source: Box::new(LifecycleError::Cancelled("op-1".to_string())),
        };

        assert!(err.is_cancelled());
        assert_eq!(LifecycleError::Cancelled("op-1".to_string()).processed(), 0);
    }
}
