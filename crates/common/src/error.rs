use thiserror::Error;

use crate::{AggregateId, Version};

/// Boxed error produced by a concrete storage driver.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by storage sessions, repositories and bulk DAOs.
///
/// Driver failures are boxed as-is so callers can still downcast to the
/// original error.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The session was already closed.
    #[error("Storage session is closed")]
    SessionClosed,

    /// The stored version no longer matches the version this session loaded.
    #[error(
        "Version conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    VersionConflict {
        aggregate_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    /// The underlying driver failed.
    #[error("Database error: {0}")]
    Database(#[source] BoxError),
}

impl StorageError {
    /// Wraps a driver error without altering it.
    pub fn database(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Database(Box::new(err))
    }
}
