//! Shared snapshot cache.
//!
//! One [`RowCache`] is shared by every session of a domain. It maps row
//! identities to their last-known committed snapshots, evicting by recency
//! when a configured capacity is exceeded. Committing sessions push their
//! change sets here; registered listeners (peer sessions) are told about
//! every processed change synchronously, after the cache's own lock is
//! released.

use rowgraph_core::{ObjectId, Snapshot};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::trace;

/// Default maximum number of cached snapshots.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// One processed change set: what was added, updated, deleted, or
/// invalidated in a single cache operation.
#[derive(Debug, Clone, Default)]
pub struct CacheChange {
    pub added: Vec<(ObjectId, Snapshot)>,
    pub updated: Vec<(ObjectId, Snapshot)>,
    pub deleted: Vec<ObjectId>,
    pub invalidated: Vec<ObjectId>,
}

impl CacheChange {
    /// Whether the change set carries nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.invalidated.is_empty()
    }
}

/// Receives every processed cache change, synchronously.
pub trait CacheListener: Send + Sync {
    fn cache_changed(&self, change: &CacheChange);
}

#[derive(Debug, Clone)]
struct Entry {
    snapshot: Snapshot,
    /// Bumped on every overwrite of this identity's snapshot.
    version: u64,
    /// Recency stamp for eviction.
    tick: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<ObjectId, Entry>,
    next_tick: u64,
}

impl Inner {
    fn touch(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Evict the least-recently-used entry, never the one named by `keep`.
    fn evict_one(&mut self, keep: &ObjectId) -> Option<ObjectId> {
        let victim = self
            .entries
            .iter()
            .filter(|(id, _)| *id != keep)
            .min_by_key(|(_, e)| e.tick)
            .map(|(id, _)| id.clone())?;
        self.entries.remove(&victim);
        Some(victim)
    }
}

/// Capacity-bounded, listener-notifying snapshot cache.
pub struct RowCache {
    inner: Mutex<Inner>,
    capacity: usize,
    listeners: RwLock<Vec<Arc<dyn CacheListener>>>,
}

impl std::fmt::Debug for RowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for RowCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RowCache {
    /// Create a cache holding at most `capacity` snapshots.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener for processed changes.
    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(listener);
    }

    /// Drop a previously registered listener, matched by identity.
    pub fn remove_listener(&self, listener: &Arc<dyn CacheListener>) {
        self.listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
    }

    /// Snapshot for an identity, marking it recently used.
    pub fn get(&self, id: &ObjectId) -> Option<Snapshot> {
        let mut inner = self.lock();
        let tick = inner.touch();
        let entry = inner.entries.get_mut(id)?;
        entry.tick = tick;
        Some(entry.snapshot.clone())
    }

    /// Current version of an identity's snapshot, if cached.
    pub fn version(&self, id: &ObjectId) -> Option<u64> {
        self.lock().entries.get(id).map(|e| e.version)
    }

    /// Number of cached snapshots.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Insert or replace a snapshot, notifying listeners.
    pub fn put(&self, id: ObjectId, snapshot: Snapshot) {
        let mut change = CacheChange::default();
        self.store(&mut change, id, snapshot, false);
        self.notify(change);
    }

    /// Merge a partial snapshot over whatever is cached, notifying
    /// listeners. Missing entries are inserted as-is.
    pub fn merge(&self, id: ObjectId, snapshot: Snapshot) {
        let mut change = CacheChange::default();
        self.store(&mut change, id, snapshot, true);
        self.notify(change);
    }

    /// Drop an identity's snapshot, notifying listeners that it was
    /// invalidated.
    pub fn invalidate(&self, id: &ObjectId) {
        let removed = self.lock().entries.remove(id).is_some();
        if removed {
            self.notify(CacheChange {
                invalidated: vec![id.clone()],
                ..CacheChange::default()
            });
        }
    }

    /// Apply a whole change set from a committed transaction in one locked
    /// pass, then notify listeners once.
    pub fn process_change(&self, change: CacheChange) {
        let mut processed = CacheChange::default();
        for (id, snapshot) in change.added {
            self.store(&mut processed, id, snapshot, false);
        }
        for (id, snapshot) in change.updated {
            self.store(&mut processed, id, snapshot, true);
        }
        {
            let mut inner = self.lock();
            for id in change.deleted {
                if inner.entries.remove(&id).is_some() {
                    processed.deleted.push(id);
                }
            }
            for id in change.invalidated {
                if inner.entries.remove(&id).is_some() {
                    processed.invalidated.push(id);
                }
            }
        }
        self.notify(processed);
    }

    fn store(&self, change: &mut CacheChange, id: ObjectId, snapshot: Snapshot, merge: bool) {
        let mut inner = self.lock();
        let tick = inner.touch();
        if let Some(entry) = inner.entries.get_mut(&id) {
            if merge {
                entry.snapshot.merge(&snapshot);
            } else {
                entry.snapshot = snapshot;
            }
            entry.version += 1;
            entry.tick = tick;
            change.updated.push((id, entry.snapshot.clone()));
            return;
        }
        if inner.entries.len() >= self.capacity {
            if let Some(victim) = inner.evict_one(&id) {
                trace!(target: "rowgraph::cache", %victim, "evicted snapshot");
            }
        }
        inner.entries.insert(
            id.clone(),
            Entry {
                snapshot: snapshot.clone(),
                version: 1,
                tick,
            },
        );
        change.added.push((id, snapshot));
    }

    fn notify(&self, change: CacheChange) {
        if change.is_empty() {
            return;
        }
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.cache_changed(&change);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgraph_core::Value;
    use std::sync::Mutex as StdMutex;

    fn id(n: i64) -> ObjectId {
        ObjectId::single("Artist", "id", Value::BigInt(n))
    }

    fn snap(name: &str) -> Snapshot {
        Snapshot::from_pairs([("name", Value::Text(name.to_string()))])
    }

    #[derive(Default)]
    struct Recorder {
        changes: StdMutex<Vec<CacheChange>>,
    }

    impl CacheListener for Recorder {
        fn cache_changed(&self, change: &CacheChange) {
            self.changes.lock().unwrap().push(change.clone());
        }
    }

    #[test]
    fn test_put_get_and_version_bump() {
        let cache = RowCache::new(10);
        cache.put(id(1), snap("a"));
        assert_eq!(cache.version(&id(1)), Some(1));
        cache.put(id(1), snap("b"));
        assert_eq!(cache.version(&id(1)), Some(2));
        let got = cache.get(&id(1)).unwrap();
        assert_eq!(
            got.get("name"),
            Some(&Value::Text("b".to_string()))
        );
    }

    #[test]
    fn test_lru_eviction_prefers_stale_entries() {
        let cache = RowCache::new(2);
        cache.put(id(1), snap("a"));
        cache.put(id(2), snap("b"));
        cache.get(&id(1));
        cache.put(id(3), snap("c"));
        assert!(cache.get(&id(1)).is_some());
        assert!(cache.get(&id(2)).is_none());
        assert!(cache.get(&id(3)).is_some());
    }

    #[test]
    fn test_put_at_capacity_never_evicts_itself() {
        let cache = RowCache::new(1);
        cache.put(id(1), snap("a"));
        cache.put(id(2), snap("b"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&id(2)).is_some());
    }

    #[test]
    fn test_merge_keeps_unlisted_columns() {
        let cache = RowCache::new(10);
        let mut full = snap("a");
        full.set("year", Value::Int(1900));
        cache.put(id(1), full);
        cache.merge(id(1), snap("b"));
        let got = cache.get(&id(1)).unwrap();
        assert_eq!(got.get("name"), Some(&Value::Text("b".to_string())));
        assert_eq!(got.get("year"), Some(&Value::Int(1900)));
    }

    #[test]
    fn test_listeners_see_adds_updates_and_deletes() {
        let cache = RowCache::new(10);
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(Arc::clone(&recorder) as Arc<dyn CacheListener>);

        cache.put(id(1), snap("a"));
        cache.put(id(1), snap("b"));
        cache.process_change(CacheChange {
            deleted: vec![id(1)],
            ..CacheChange::default()
        });

        let changes = recorder.changes.lock().unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].added.len(), 1);
        assert_eq!(changes[1].updated.len(), 1);
        assert_eq!(changes[2].deleted, vec![id(1)]);
    }

    #[test]
    fn test_invalidate_of_absent_identity_is_silent() {
        let cache = RowCache::new(10);
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(Arc::clone(&recorder) as Arc<dyn CacheListener>);
        cache.invalidate(&id(9));
        assert!(recorder.changes.lock().unwrap().is_empty());
    }
}
