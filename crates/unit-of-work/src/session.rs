//! Storage backend contracts.

use async_trait::async_trait;
use common::{IsolationLevel, StorageError};

use crate::seen::SeenSet;

/// A native storage transaction.
///
/// After `commit` or `rollback` the session keeps working in a fresh native
/// transaction until `close`. `close` must be safe to call more than once.
#[async_trait]
pub trait StorageSession: Send + 'static {
    async fn commit(&mut self) -> Result<(), StorageError>;

    async fn rollback(&mut self) -> Result<(), StorageError>;

    async fn close(&mut self) -> Result<(), StorageError>;
}

/// The set of tracked repositories bound to one session.
pub trait RepositoryRegistry: Send + 'static {
    /// Every seen-set owned by the registry.
    fn seen_sets(&mut self) -> Vec<&mut SeenSet>;
}

/// Opens transaction scopes.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Session: StorageSession;
    type Repositories: RepositoryRegistry;

    /// Starts a native transaction and builds repositories bound to it.
    async fn open(
        &self,
        isolation: IsolationLevel,
    ) -> Result<(Self::Session, Self::Repositories), StorageError>;
}
