//! Repository contract and the tracking decorator.

use async_trait::async_trait;
use common::StorageError;
use domain::Aggregate;

use crate::seen::SeenSet;
use crate::shared::Shared;

/// Storage access for one aggregate type, bound to a transaction scope.
///
/// Implementations return the same [`Shared`] handle for the same stored row
/// for as long as the scope lives.
#[async_trait]
pub trait Repository: Send {
    type Aggregate: Aggregate;

    /// Query criteria understood by this repository.
    type Criteria: Send + Sync;

    async fn find(
        &mut self,
        criteria: &Self::Criteria,
    ) -> Result<Vec<Shared<Self::Aggregate>>, StorageError>;

    /// Stages aggregates for insertion, assigning identities to new ones.
    async fn add(&mut self, aggregates: Vec<Shared<Self::Aggregate>>) -> Result<(), StorageError>;

    /// Stages deletion of every match and returns what was removed.
    async fn remove(
        &mut self,
        criteria: &Self::Criteria,
    ) -> Result<Vec<Shared<Self::Aggregate>>, StorageError>;
}

/// Wraps a repository and records every aggregate it returns or accepts.
///
/// Type-specific operations built on [`Tracked::inner_mut`] record their
/// handles through [`Tracked::track`].
#[derive(Debug)]
pub struct Tracked<R> {
    inner: R,
    seen: SeenSet,
}

impl<R> Tracked<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            seen: SeenSet::new(),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    /// Mutable access for the unit of work's registry.
    pub fn seen_mut(&mut self) -> &mut SeenSet {
        &mut self.seen
    }

    pub fn track<A: Aggregate>(&mut self, handles: &[Shared<A>]) {
        for handle in handles {
            self.seen.insert(handle);
        }
    }
}

impl<R: Repository> Tracked<R> {
    pub async fn add_one(&mut self, aggregate: Shared<R::Aggregate>) -> Result<(), StorageError> {
        self.add(vec![aggregate]).await
    }

    /// Returns the only match, `None` when nothing matches.
    ///
    /// Every match is tracked even when more than one is found.
    pub async fn find_one(
        &mut self,
        criteria: &R::Criteria,
    ) -> Result<Option<Shared<R::Aggregate>>, StorageError> {
        Ok(self.find(criteria).await?.into_iter().next())
    }
}

#[async_trait]
impl<R: Repository> Repository for Tracked<R> {
    type Aggregate = R::Aggregate;
    type Criteria = R::Criteria;

    async fn find(
        &mut self,
        criteria: &Self::Criteria,
    ) -> Result<Vec<Shared<Self::Aggregate>>, StorageError> {
        let found = self.inner.find(criteria).await?;
        self.track(&found);
        Ok(found)
    }

    async fn add(&mut self, aggregates: Vec<Shared<Self::Aggregate>>) -> Result<(), StorageError> {
        self.track(&aggregates);
        self.inner.add(aggregates).await
    }

    async fn remove(
        &mut self,
        criteria: &Self::Criteria,
    ) -> Result<Vec<Shared<Self::Aggregate>>, StorageError> {
        let removed = self.inner.remove(criteria).await?;
        self.track(&removed);
        Ok(removed)
    }
}
