//! Per-repository record of aggregates touched during a transaction.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use common::Version;
use domain::{Aggregate, DomainEvent};

use crate::shared::Shared;

/// Type-erased view of a tracked aggregate used by the commit protocol.
#[async_trait]
pub(crate) trait TrackedAggregate: Send + Sync {
    fn key(&self) -> usize;

    fn aggregate_type(&self) -> &'static str;

    async fn take_events(&self) -> Vec<DomainEvent>;

    async fn advance_version(&self) -> Version;
}

#[async_trait]
impl<A: Aggregate> TrackedAggregate for Shared<A> {
    fn key(&self) -> usize {
        Shared::key(self)
    }

    fn aggregate_type(&self) -> &'static str {
        A::aggregate_type()
    }

    async fn take_events(&self) -> Vec<DomainEvent> {
        self.lock().await.take_events()
    }

    async fn advance_version(&self) -> Version {
        self.lock().await.advance_version()
    }
}

/// Aggregates a repository has returned or accepted since the last commit.
///
/// Membership is by instance identity and insertion order is kept. Only the
/// unit of work can empty the set.
#[derive(Default)]
pub struct SeenSet {
    entries: Vec<Arc<dyn TrackedAggregate>>,
    keys: HashSet<usize>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `handle`; returns false when it was already present.
    pub fn insert<A: Aggregate>(&mut self, handle: &Shared<A>) -> bool {
        if !self.keys.insert(handle.key()) {
            return false;
        }
        self.entries.push(Arc::new(handle.clone()));
        true
    }

    pub fn contains<A: Aggregate>(&self, handle: &Shared<A>) -> bool {
        self.keys.contains(&handle.key())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<Arc<dyn TrackedAggregate>> {
        self.keys.clear();
        std::mem::take(&mut self.entries)
    }
}

impl fmt::Debug for SeenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| entry.aggregate_type()))
            .finish()
    }
}
