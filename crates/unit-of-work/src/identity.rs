//! Transaction-scoped identity map.

use std::collections::BTreeMap;

use common::{AggregateId, Version};
use domain::Aggregate;

use crate::shared::Shared;

/// A mapped aggregate and the version it had in storage when loaded.
///
/// `persisted` is `None` for aggregates added in this scope that storage has
/// never held.
#[derive(Debug)]
pub struct IdentityEntry<A> {
    pub id: AggregateId,
    pub handle: Shared<A>,
    pub persisted: Option<Version>,
}

/// Maps stored rows to the single in-memory instance that represents them.
#[derive(Debug)]
pub struct IdentityMap<A> {
    entries: BTreeMap<AggregateId, IdentityEntry<A>>,
}

impl<A> Default for IdentityMap<A> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<A: Aggregate> IdentityMap<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &AggregateId) -> Option<&Shared<A>> {
        self.entries.get(id).map(|e| &e.handle)
    }

    pub fn contains(&self, id: &AggregateId) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns the mapped handle for a loaded row, mapping `load()` if absent.
    pub fn resolve(
        &mut self,
        id: AggregateId,
        version: Version,
        load: impl FnOnce() -> A,
    ) -> Shared<A> {
        self.entries
            .entry(id)
            .or_insert_with(|| IdentityEntry {
                id,
                handle: Shared::new(load()),
                persisted: Some(version),
            })
            .handle
            .clone()
    }

    /// Maps an added aggregate, assigning an identity when it has none.
    ///
    /// An aggregate that already carries an identity is treated as previously
    /// stored at its current version.
    pub async fn register(&mut self, handle: Shared<A>) -> AggregateId {
        let (id, persisted) = {
            let mut aggregate = handle.lock().await;
            let had_id = aggregate.id().is_some();
            let id = aggregate.assign_id(AggregateId::new());
            (id, had_id.then(|| aggregate.version()))
        };

        match self.entries.get_mut(&id) {
            Some(entry) => entry.handle = handle,
            None => {
                self.entries.insert(
                    id,
                    IdentityEntry {
                        id,
                        handle,
                        persisted,
                    },
                );
            }
        }
        id
    }

    pub fn evict(&mut self, id: &AggregateId) -> Option<IdentityEntry<A>> {
        self.entries.remove(id)
    }

    /// Records that `id` is now stored at `version`.
    pub fn mark_persisted(&mut self, id: &AggregateId, version: Version) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.persisted = Some(version);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdentityEntry<A>> {
        self.entries.values()
    }

    pub fn handles(&self) -> Vec<Shared<A>> {
        self.entries.values().map(|e| e.handle.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use domain::AggregateMeta;

    use super::*;

    #[derive(Debug, Default)]
    struct Sample {
        meta: AggregateMeta,
    }

    impl Aggregate for Sample {
        fn aggregate_type() -> &'static str {
            "Sample"
        }

        fn meta(&self) -> &AggregateMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut AggregateMeta {
            &mut self.meta
        }
    }

    #[test]
    fn resolve_returns_the_same_instance() {
        let mut map = IdentityMap::new();
        let id = AggregateId::new();
        let restore = || Sample {
            meta: AggregateMeta::restore(id, Version::new(3)),
        };

        let first = map.resolve(id, Version::new(3), restore);
        let second = map.resolve(id, Version::new(3), restore);

        assert!(first.ptr_eq(&second));
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn register_assigns_identity_to_new_aggregates() {
        let mut map = IdentityMap::new();
        let handle = Shared::new(Sample::default());

        let id = map.register(handle.clone()).await;

        assert_eq!(handle.id().await, Some(id));
        let entry = map.iter().next().unwrap();
        assert!(entry.persisted.is_none());
    }

    #[tokio::test]
    async fn register_treats_identified_aggregates_as_stored() {
        let mut map = IdentityMap::new();
        let id = AggregateId::new();
        let handle = Shared::new(Sample {
            meta: AggregateMeta::restore(id, Version::new(2)),
        });

        assert_eq!(map.register(handle).await, id);
        assert_eq!(map.iter().next().unwrap().persisted, Some(Version::new(2)));
    }
}
