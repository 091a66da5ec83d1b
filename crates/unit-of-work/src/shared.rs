//! Shared aggregate handles.

use std::fmt;
use std::sync::Arc;

use common::{AggregateId, Version};
use domain::Aggregate;
use tokio::sync::{Mutex, MutexGuard};

/// A handle to one in-memory aggregate instance.
///
/// Repositories hand out clones of the same handle for the same stored row
/// within a transaction scope, so a version advanced at commit is visible to
/// every holder. Identity is the allocation, not the aggregate id.
///
/// Do not hold the guard returned by [`Shared::lock`] across a repository
/// call: repositories lock the handles they return.
pub struct Shared<A>(Arc<Mutex<A>>);

impl<A> Clone for Shared<A> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<A: Aggregate> Shared<A> {
    pub fn new(aggregate: A) -> Self {
        Self(Arc::new(Mutex::new(aggregate)))
    }

    pub async fn lock(&self) -> MutexGuard<'_, A> {
        self.0.lock().await
    }

    /// Returns true when both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub async fn id(&self) -> Option<AggregateId> {
        self.lock().await.id()
    }

    pub async fn version(&self) -> Version {
        self.lock().await.version()
    }

    /// Clones the current state out of the handle.
    pub async fn snapshot(&self) -> A
    where
        A: Clone,
    {
        self.lock().await.clone()
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl<A> From<A> for Shared<A>
where
    A: Aggregate,
{
    fn from(aggregate: A) -> Self {
        Self::new(aggregate)
    }
}

impl<A> fmt::Debug for Shared<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared")
            .field(&(Arc::as_ptr(&self.0) as *const ()))
            .finish()
    }
}
