//! Domain error types.

use common::StorageError;
use thiserror::Error;

/// Broad classification of a [`DomainError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller supplied a value the aggregate's invariants reject.
    Validation,
    /// The caller tried to remove state that must always exist.
    ProtectedState,
    /// A collaborator (storage, DAO) failed.
    Collaborator,
}

/// Errors raised by aggregate mutators.
///
/// Mutators validate before touching state, so an error always leaves the
/// aggregate unchanged.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task list name must not be empty")]
    EmptyName,

    #[error("Status label must not be empty")]
    EmptyStatus,

    #[error("Task title must not be empty")]
    EmptyTitle,

    #[error("Tag must not be empty")]
    EmptyTag,

    /// The status is not part of the list's vocabulary.
    #[error("Invalid status {status}")]
    InvalidStatus { status: String },

    /// The migration target of a status removal is not usable.
    #[error("Invalid migration status {status}")]
    InvalidMigrationStatus { status: String },

    /// The status is reserved and can never be removed.
    #[error("Status {status} is protected and cannot be removed")]
    ProtectedStatus { status: String },

    /// The operation needs the aggregate to have been persisted first.
    #[error("{aggregate_type} has not been persisted yet")]
    NotPersisted { aggregate_type: &'static str },

    /// The task does not belong to the given list.
    #[error("Task belongs to a different task list")]
    ForeignTaskList,

    /// A storage collaborator failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl DomainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::ProtectedStatus { .. } => ErrorKind::ProtectedState,
            DomainError::Storage(_) => ErrorKind::Collaborator,
            _ => ErrorKind::Validation,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}
