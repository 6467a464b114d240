use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde_json::{Map, Value};

use crate::types::{CollectionKey, CollectionKind, Entity};

/// Immutable view of one collection. Writers swap in a new `Arc`, so a
/// reader holding a snapshot never sees a half-applied update.
pub type Snapshot = Arc<Vec<Entity>>;

/// The narrow surface the reconciler and the refresher need from a cache.
pub trait CachePort: Send + Sync {
    fn collections_of_kind(&self, kind: CollectionKind) -> Vec<CollectionKey>;

    /// `None` when the collection has never been fetched.
    fn snapshot(&self, key: &CollectionKey) -> Option<Snapshot>;

    fn is_stale(&self, key: &CollectionKey) -> bool;

    /// Stores a freshly fetched collection and clears its stale flag.
    fn put(&self, key: CollectionKey, entities: Vec<Entity>) -> Snapshot;

    /// Replaces entity `id` in full. Returns whether the collection changed.
    fn replace_entity(&self, key: &CollectionKey, id: &str, value: &Entity) -> bool;

    /// Shallow-merges `partial` onto entity `id`. Returns whether the
    /// collection changed.
    fn merge_entity(&self, key: &CollectionKey, id: &str, partial: &Map<String, Value>) -> bool;

    fn mark_stale(&self, key: &CollectionKey);
}

#[derive(Debug, Clone, Default)]
pub struct CachedCollection {
    pub data: Option<Snapshot>,
    pub stale: bool,
}

#[derive(Clone)]
pub struct QueryCache {
    primary: Arc<DashMap<CollectionKey, CachedCollection>>,
    kind_index: Arc<DashMap<CollectionKind, DashSet<CollectionKey>>>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self {
            primary: Arc::new(DashMap::new()),
            kind_index: Arc::new(DashMap::new()),
        }
    }

    fn index(&self, key: &CollectionKey) {
        self.kind_index
            .entry(key.kind)
            .or_default()
            .insert(key.clone());
    }

    /// Copy-on-write update of a single entity. `f` returns the new value,
    /// or `None` to leave the collection as it is.
    fn update_entity<F>(&self, key: &CollectionKey, id: &str, f: F) -> bool
    where
        F: FnOnce(&Entity) -> Option<Entity>,
    {
        let Some(mut entry) = self.primary.get_mut(key) else {
            return false;
        };
        let Some(data) = entry.data.as_ref() else {
            return false;
        };
        let Some(position) = data.iter().position(|e| e.id() == id) else {
            return false;
        };
        let Some(next) = f(&data[position]) else {
            return false;
        };
        if next == data[position] {
            return false;
        }

        let mut entities = data.to_vec();
        entities[position] = next;
        entry.data = Some(Arc::new(entities));
        true
    }
}

impl CachePort for QueryCache {
    fn collections_of_kind(&self, kind: CollectionKind) -> Vec<CollectionKey> {
        match self.kind_index.get(&kind) {
            Some(keys) => keys.iter().map(|k| k.key().clone()).collect(),
            None => Vec::new(),
        }
    }

    fn snapshot(&self, key: &CollectionKey) -> Option<Snapshot> {
        self.primary.get(key).and_then(|entry| entry.data.clone())
    }

    fn is_stale(&self, key: &CollectionKey) -> bool {
        self.primary.get(key).map(|entry| entry.stale).unwrap_or(false)
    }

    fn put(&self, key: CollectionKey, entities: Vec<Entity>) -> Snapshot {
        let snapshot = Arc::new(entities);
        self.index(&key);
        self.primary.insert(
            key,
            CachedCollection {
                data: Some(snapshot.clone()),
                stale: false,
            },
        );
        snapshot
    }

    fn replace_entity(&self, key: &CollectionKey, id: &str, value: &Entity) -> bool {
        self.update_entity(key, id, |_| Some(value.clone()))
    }

    fn merge_entity(&self, key: &CollectionKey, id: &str, partial: &Map<String, Value>) -> bool {
        self.update_entity(key, id, |current| Some(current.merged(partial)))
    }

    fn mark_stale(&self, key: &CollectionKey) {
        // a missing collection keeps `data: None`; only the flag is recorded
        self.primary.entry(key.clone()).or_default().stale = true;
        self.index(key);
    }
}
