use common::{AggregateId, StorageError};
use domain::DomainError;
use thiserror::Error;
use unit_of_work::UowError;

/// Errors returned by [`crate::TaskListService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The addressed resource does not exist.
    #[error("{resource} {id} does not exist")]
    NotFound {
        resource: &'static str,
        id: AggregateId,
    },

    /// A resource with the same key already exists.
    #[error("{resource} {key} already exists")]
    AlreadyExists { resource: &'static str, key: String },

    /// A lookup by id matched more than one row.
    #[error("Found multiple {resource} with id {id}")]
    Ambiguous {
        resource: &'static str,
        id: AggregateId,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Uow(#[from] UowError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ServiceError {
    /// Returns true for errors caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        match self {
            ServiceError::NotFound { .. } | ServiceError::AlreadyExists { .. } => true,
            ServiceError::Domain(err) => !matches!(err, DomainError::Storage(_)),
            _ => false,
        }
    }
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
