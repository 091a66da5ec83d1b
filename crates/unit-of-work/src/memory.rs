//! Building blocks for in-memory storage backends.
//!
//! A backend keeps committed rows in [`MemoryTable`]s behind a lock and gives
//! every session a [`StagedTable`] per aggregate type. Staged work becomes
//! visible to other sessions only when the session commits.

use std::collections::BTreeMap;

use common::{AggregateId, StorageError, Version};
use domain::Aggregate;

use crate::identity::IdentityMap;
use crate::shared::Shared;

/// Committed rows of one aggregate type.
#[derive(Debug, Clone)]
pub struct MemoryTable<A> {
    rows: BTreeMap<AggregateId, A>,
}

impl<A> Default for MemoryTable<A> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<A: Aggregate + Clone> MemoryTable<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &AggregateId) -> Option<&A> {
        self.rows.get(id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &A> {
        self.rows.values()
    }

    /// Stores `row` under `id` as committed state. Pending events are dropped.
    pub fn insert(&mut self, id: AggregateId, mut row: A) {
        row.take_events();
        self.rows.insert(id, row);
    }

    pub fn delete(&mut self, id: &AggregateId) -> Option<A> {
        self.rows.remove(id)
    }

    pub fn retain(&mut self, keep: impl FnMut(&AggregateId, &mut A) -> bool) {
        self.rows.retain(keep);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Writes a session validated against committed state.
#[derive(Debug)]
pub struct StagedChanges<A> {
    upserts: Vec<(AggregateId, A)>,
    deletes: Vec<AggregateId>,
}

impl<A> StagedChanges<A> {
    pub fn deleted(&self) -> &[AggregateId] {
        &self.deletes
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// One session's identity map and staged deletions for one aggregate type.
#[derive(Debug)]
pub struct StagedTable<A> {
    map: IdentityMap<A>,
    removed: BTreeMap<AggregateId, Option<Version>>,
}

impl<A> Default for StagedTable<A> {
    fn default() -> Self {
        Self {
            map: IdentityMap::default(),
            removed: BTreeMap::new(),
        }
    }
}

impl<A: Aggregate + Clone> StagedTable<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity_map(&self) -> &IdentityMap<A> {
        &self.map
    }

    /// Returns every match, preferring this session's instances over stored rows.
    pub async fn find<F>(&mut self, committed: &MemoryTable<A>, matches: F) -> Vec<Shared<A>>
    where
        F: Fn(&A) -> bool + Send + Sync,
    {
        let mut found = Vec::new();
        for handle in self.map.handles() {
            let hit = matches(&*handle.lock().await);
            if hit {
                found.push(handle);
            }
        }

        for (id, row) in &committed.rows {
            if self.map.contains(id) || self.removed.contains_key(id) || !matches(row) {
                continue;
            }
            found.push(self.map.resolve(*id, row.version(), || row.clone()));
        }
        found
    }

    pub async fn add(&mut self, handle: Shared<A>) -> AggregateId {
        let id = self.map.register(handle).await;
        self.removed.remove(&id);
        id
    }

    /// Stages deletion of every match and returns the removed instances.
    pub async fn remove<F>(&mut self, committed: &MemoryTable<A>, matches: F) -> Vec<Shared<A>>
    where
        F: Fn(&A) -> bool + Send + Sync,
    {
        let found = self.find(committed, matches).await;
        for handle in &found {
            if let Some(id) = handle.id().await
                && let Some(entry) = self.map.evict(&id)
                && entry.persisted.is_some()
            {
                self.removed.insert(id, entry.persisted);
            }
        }
        found
    }

    /// Checks every staged row against `committed` and snapshots what to write.
    pub async fn prepare(
        &self,
        committed: &MemoryTable<A>,
    ) -> Result<StagedChanges<A>, StorageError> {
        let mut upserts = Vec::with_capacity(self.map.len());
        for entry in self.map.iter() {
            check_version(committed, entry.id, entry.persisted)?;
            let row = entry.handle.lock().await.clone();
            upserts.push((entry.id, row));
        }
        for (id, expected) in &self.removed {
            check_version(committed, *id, *expected)?;
        }

        Ok(StagedChanges {
            upserts,
            deletes: self.removed.keys().copied().collect(),
        })
    }

    /// Writes prepared changes and rebases the identity map on them.
    pub fn apply(&mut self, committed: &mut MemoryTable<A>, changes: StagedChanges<A>) {
        for id in &changes.deletes {
            committed.delete(id);
        }
        for (id, row) in changes.upserts {
            self.map.mark_persisted(&id, row.version());
            committed.insert(id, row);
        }
        self.removed.clear();
    }

    /// Forgets all staged work and every mapped instance.
    pub fn discard(&mut self) {
        self.map.clear();
        self.removed.clear();
    }
}

fn check_version<A: Aggregate>(
    committed: &MemoryTable<A>,
    id: AggregateId,
    expected: Option<Version>,
) -> Result<(), StorageError> {
    if let Some(expected) = expected
        && let Some(current) = committed.rows.get(&id)
        && current.version() != expected
    {
        return Err(StorageError::VersionConflict {
            aggregate_id: id,
            expected,
            actual: current.version(),
        });
    }
    Ok(())
}
