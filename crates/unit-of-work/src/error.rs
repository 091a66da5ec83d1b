use common::{BoxError, StorageError};
use thiserror::Error;

use crate::uow::UowState;

/// A publisher failed to deliver an event.
#[derive(Debug, Error)]
#[error("Failed to publish on {channel}: {source}")]
pub struct PublishError {
    pub channel: String,
    #[source]
    pub source: BoxError,
}

impl PublishError {
    pub fn new(channel: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            channel: channel.into(),
            source: source.into(),
        }
    }
}

/// Errors raised by the unit of work.
#[derive(Debug, Error)]
pub enum UowError {
    /// The operation is not valid in the current lifecycle state.
    #[error("Cannot {operation} a unit of work that is {state}")]
    InvalidState {
        operation: &'static str,
        state: UowState,
    },

    /// The storage session failed. Nothing was published.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Publishing failed part way. The first `published` events went out,
    /// no version was advanced and storage was not committed.
    #[error("Publishing failed after {published} event(s): {source}")]
    Publish {
        published: usize,
        #[source]
        source: PublishError,
    },

    /// Events were published and versions advanced, then the native commit
    /// failed. Subscribers have seen changes that storage does not hold.
    #[error(
        "Storage commit failed after publishing {events_published} event(s) and advancing {aggregates_advanced} aggregate(s): {source}"
    )]
    DivergentCommit {
        events_published: usize,
        aggregates_advanced: usize,
        #[source]
        source: StorageError,
    },
}

impl UowError {
    /// Returns true when subscribers may have observed changes that were not stored.
    pub fn is_divergent(&self) -> bool {
        match self {
            UowError::DivergentCommit { .. } => true,
            UowError::Publish { published, .. } => *published > 0,
            _ => false,
        }
    }
}

/// Result type for unit of work operations.
pub type Result<T> = std::result::Result<T, UowError>;
