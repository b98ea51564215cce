//! Per-session identity map and change tracker.
//!
//! Each session owns exactly one [`ObjectGraphStore`]. The store guarantees
//! at most one [`DomainObject`] per identity (the identity map), keeps a
//! baseline snapshot per object for diffing and rollback, and accumulates
//! the session's uncommitted changes as a [`Diff`]. Stores are never shared
//! across sessions, so they carry no locking of their own.

use crate::diff::{Diff, GraphChange};
use rowgraph_core::{DomainObject, ObjectHandle, ObjectId, ObjectState, RelationshipHolder, Snapshot};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Lock an object handle for writing, ignoring poisoning.
pub fn write_object(handle: &ObjectHandle) -> std::sync::RwLockWriteGuard<'_, DomainObject> {
    handle.write().unwrap_or_else(PoisonError::into_inner)
}

/// Lock an object handle for reading, ignoring poisoning.
pub fn read_object(handle: &ObjectHandle) -> std::sync::RwLockReadGuard<'_, DomainObject> {
    handle.read().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct ObjectGraphStore {
    objects: HashMap<ObjectId, ObjectHandle>,
    /// Last-known committed snapshot per object: the diff baseline and the
    /// rollback source.
    baselines: HashMap<ObjectId, Snapshot>,
    diff: Diff,
}

impl ObjectGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object under its identity. If the identity is already
    /// mapped, the existing object is returned and the argument discarded.
    pub fn register_node(&mut self, object: DomainObject) -> ObjectHandle {
        let id = object.id().clone();
        if let Some(existing) = self.objects.get(&id) {
            return Arc::clone(existing);
        }
        let handle: ObjectHandle = Arc::new(RwLock::new(object));
        self.objects.insert(id, Arc::clone(&handle));
        handle
    }

    /// Look up the registered object for an identity.
    pub fn get(&self, id: &ObjectId) -> Option<ObjectHandle> {
        self.objects.get(id).cloned()
    }

    /// Whether an identity is registered.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All registered objects.
    pub fn objects(&self) -> impl Iterator<Item = &ObjectHandle> {
        self.objects.values()
    }

    /// Objects carrying uncommitted work.
    pub fn dirty_objects(&self) -> Vec<ObjectHandle> {
        self.objects
            .values()
            .filter(|h| read_object(h).state().is_dirty())
            .cloned()
            .collect()
    }

    /// Baseline snapshot for an identity.
    pub fn baseline(&self, id: &ObjectId) -> Option<&Snapshot> {
        self.baselines.get(id)
    }

    /// Install a baseline snapshot (fetched or freshly committed state).
    pub fn set_baseline(&mut self, id: ObjectId, snapshot: Snapshot) {
        self.baselines.insert(id, snapshot);
    }

    /// Retain a pre-modification snapshot unless one is already held.
    ///
    /// Called on the first direct property write; an earlier
    /// relationship-only change must not have suppressed retention.
    pub fn retain_snapshot(&mut self, id: &ObjectId, snapshot: Snapshot) {
        self.baselines.entry(id.clone()).or_insert(snapshot);
    }

    /// Append a change to the session's diff.
    pub fn record(&mut self, change: GraphChange) {
        self.diff.record(change);
    }

    /// Whether any uncommitted change is recorded.
    pub fn has_changes(&self) -> bool {
        !self.diff.is_empty()
    }

    /// The accumulated diff.
    pub fn diff(&self) -> &Diff {
        &self.diff
    }

    /// Take the accumulated diff, leaving an empty one.
    /// Append another session's change log after the local one.
    pub fn append_diff(&mut self, diff: Diff) {
        self.diff.append(diff);
    }

    pub fn take_diff(&mut self) -> Diff {
        std::mem::take(&mut self.diff)
    }

    /// Detach objects from the session: state becomes TRANSIENT, baselines
    /// and pending changes are dropped, the identity map forgets them.
    /// Handles held by application code stay valid but orphaned.
    pub fn unregister(&mut self, ids: &[ObjectId]) {
        for id in ids {
            if let Some(handle) = self.objects.remove(id) {
                write_object(&handle).set_state(ObjectState::Transient);
            }
            self.baselines.remove(id);
            self.diff.remove_changes_for(id);
        }
    }

    /// Hollow out objects without detaching them: attributes are dropped,
    /// relationship holders revert to faults, baselines are forgotten. The
    /// next attribute access re-fetches.
    pub fn invalidate(&mut self, ids: &[ObjectId]) {
        for id in ids {
            if let Some(handle) = self.objects.get(id) {
                let mut object = write_object(handle);
                object.clear_attributes();
                let relationship_names: Vec<String> =
                    object.relationships().keys().cloned().collect();
                for name in relationship_names {
                    let fault = match object.relationship(&name) {
                        Some(RelationshipHolder::ToOne(_) | RelationshipHolder::ToOneFault) => {
                            RelationshipHolder::ToOneFault
                        }
                        _ => RelationshipHolder::to_many_fault(),
                    };
                    object.set_relationship(name, fault);
                }
                object.set_state(ObjectState::Hollow);
            }
            self.baselines.remove(id);
        }
    }

    /// Rewrite a temporary identity to its permanent form everywhere: the
    /// identity map key, the object itself, every relationship holder of
    /// every registered object, the baseline map, and the pending diff.
    pub fn process_id_change(&mut self, old: &ObjectId, new: &ObjectId) {
        if let Some(handle) = self.objects.remove(old) {
            write_object(&handle).set_id(new.clone());
            self.objects.insert(new.clone(), handle);
        }
        for handle in self.objects.values() {
            write_object(handle).replace_related_id(old, new);
        }
        if let Some(snapshot) = self.baselines.remove(old) {
            self.baselines.insert(new.clone(), snapshot);
        }
        self.diff.replace_id(old, new);
    }

    /// Forget every pending change (after a successful commit or rollback).
    pub fn clear_diff(&mut self) {
        self.diff.clear();
    }

    /// Remove an object after its row was deleted and committed.
    pub fn remove(&mut self, id: &ObjectId) -> Option<ObjectHandle> {
        self.baselines.remove(id);
        self.objects.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgraph_core::Value;

    fn id(n: i64) -> ObjectId {
        ObjectId::single("Artist", "id", Value::BigInt(n))
    }

    fn committed(object_id: ObjectId) -> DomainObject {
        let mut object = DomainObject::new(object_id);
        object.set_state(ObjectState::Committed);
        object
    }

    #[test]
    fn test_register_deduplicates_by_identity() {
        let mut store = ObjectGraphStore::new();
        let first = store.register_node(committed(id(1)));
        write_object(&first).set("name", Value::Text("kept".to_string()));
        let second = store.register_node(committed(id(1)));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            read_object(&second).get("name"),
            Some(&Value::Text("kept".to_string()))
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unregister_detaches_and_drops_changes() {
        let mut store = ObjectGraphStore::new();
        let handle = store.register_node(committed(id(1)));
        store.set_baseline(id(1), Snapshot::new());
        store.record(GraphChange::PropertySet {
            id: id(1),
            property: "name".to_string(),
            new_value: Value::Text("x".to_string()),
            old_value: None,
        });
        store.unregister(&[id(1)]);
        assert!(store.get(&id(1)).is_none());
        assert!(store.baseline(&id(1)).is_none());
        assert!(!store.has_changes());
        assert_eq!(read_object(&handle).state(), ObjectState::Transient);
    }

    #[test]
    fn test_invalidate_hollows_without_detaching() {
        let mut store = ObjectGraphStore::new();
        let handle = store.register_node(committed(id(1)));
        {
            let mut object = write_object(&handle);
            object.set("name", Value::Text("x".to_string()));
            object.set_relationship(
                "paintings",
                RelationshipHolder::ToMany(vec![ObjectId::single(
                    "Painting",
                    "id",
                    Value::BigInt(5),
                )]),
            );
        }
        store.set_baseline(id(1), Snapshot::new());
        store.invalidate(&[id(1)]);
        let object = read_object(&handle);
        assert_eq!(object.state(), ObjectState::Hollow);
        assert!(object.get("name").is_none());
        assert!(object.relationship("paintings").unwrap().is_fault());
        assert!(store.baseline(&id(1)).is_none());
        assert!(store.contains(&id(1)));
    }

    #[test]
    fn test_retain_snapshot_keeps_first_image() {
        let mut store = ObjectGraphStore::new();
        let before = Snapshot::from_pairs([("name", Value::Text("old".to_string()))]);
        store.retain_snapshot(&id(1), before);
        store.retain_snapshot(
            &id(1),
            Snapshot::from_pairs([("name", Value::Text("newer".to_string()))]),
        );
        assert_eq!(
            store.baseline(&id(1)).unwrap().get("name"),
            Some(&Value::Text("old".to_string()))
        );
    }

    #[test]
    fn test_id_change_propagates_everywhere() {
        let mut store = ObjectGraphStore::new();
        let temp = ObjectId::temporary("Artist");
        let painting = store.register_node(committed(id(10)));
        write_object(&painting)
            .set_relationship("artist", RelationshipHolder::ToOne(Some(temp.clone())));
        let artist = store.register_node(committed(temp.clone()));
        store.set_baseline(temp.clone(), Snapshot::new());
        store.record(GraphChange::NodeCreated { id: temp.clone() });

        store.process_id_change(&temp, &id(1));

        assert!(store.get(&temp).is_none());
        let moved = store.get(&id(1)).unwrap();
        assert!(Arc::ptr_eq(&moved, &artist));
        assert_eq!(read_object(&artist).id(), &id(1));
        assert_eq!(
            read_object(&painting)
                .relationship("artist")
                .unwrap()
                .to_one_id(),
            Some(Some(&id(1)))
        );
        assert!(store.baseline(&id(1)).is_some());
        assert_eq!(
            store.diff().iter().next(),
            Some(&GraphChange::NodeCreated { id: id(1) })
        );
    }
}
