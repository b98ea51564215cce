//! Runtime persistent objects.
//!
//! Objects are dynamic records: a [`DomainObject`] carries its identity, a
//! lifecycle state, attribute values, and per-relationship holders. Object
//! code reaches them through a shared [`ObjectHandle`]; the owning session's
//! graph store keeps exactly one handle per identity.
//!
//! Relationships store [`ObjectId`]s, not handles. This keeps the graph free
//! of `Arc` cycles and lets a holder describe rows that were never fetched.

use crate::error::{Error, Result};
use crate::object_id::ObjectId;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Shared, lockable reference to a persistent object.
pub type ObjectHandle = Arc<RwLock<DomainObject>>;

/// Lifecycle state of a persistent object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Not registered with any session.
    Transient,
    /// Registered, will be inserted on commit.
    New,
    /// Registered and unchanged since the last fetch or commit.
    Committed,
    /// Registered with uncommitted attribute or relationship changes.
    Modified,
    /// Registered by identity only; attributes load on first access.
    Hollow,
    /// Scheduled for deletion on commit.
    Deleted,
}

impl ObjectState {
    /// Whether the object carries uncommitted work.
    pub fn is_dirty(self) -> bool {
        matches!(self, Self::New | Self::Modified | Self::Deleted)
    }
}

/// A to-one or to-many relationship slot on an object.
///
/// A holder is either a *fault* (target rows not fetched) or *resolved*
/// (target ids known). Mutations against a to-many fault accumulate as
/// pending adds/removes and are folded in when the fault fires, so writing
/// never forces a fetch.
#[derive(Debug, Clone)]
pub enum RelationshipHolder {
    /// To-one target, known. `None` means the FK is null.
    ToOne(Option<ObjectId>),
    /// To-one target not yet fetched.
    ToOneFault,
    /// To-many targets, fully known.
    ToMany(Vec<ObjectId>),
    /// To-many targets not yet fetched, with uncommitted edits applied on
    /// top once the fetch happens.
    ToManyFault {
        pending_adds: Vec<ObjectId>,
        pending_removes: Vec<ObjectId>,
    },
}

impl RelationshipHolder {
    /// A fresh to-many fault with no pending edits.
    pub fn to_many_fault() -> Self {
        Self::ToManyFault {
            pending_adds: Vec::new(),
            pending_removes: Vec::new(),
        }
    }

    /// Whether the holder still needs a fetch to answer reads.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::ToOneFault | Self::ToManyFault { .. })
    }

    /// Record an addition. Faults accumulate it; resolved lists apply it.
    pub fn add(&mut self, id: ObjectId) {
        match self {
            Self::ToMany(ids) => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            Self::ToManyFault {
                pending_adds,
                pending_removes,
            } => {
                pending_removes.retain(|r| *r != id);
                if !pending_adds.contains(&id) {
                    pending_adds.push(id);
                }
            }
            Self::ToOne(slot) => *slot = Some(id),
            Self::ToOneFault => *self = Self::ToOne(Some(id)),
        }
    }

    /// Record a removal. Faults accumulate it; resolved lists apply it.
    pub fn remove(&mut self, id: &ObjectId) {
        match self {
            Self::ToMany(ids) => ids.retain(|x| x != id),
            Self::ToManyFault {
                pending_adds,
                pending_removes,
            } => {
                pending_adds.retain(|a| a != id);
                if !pending_removes.contains(id) {
                    pending_removes.push(id.clone());
                }
            }
            Self::ToOne(slot) => {
                if slot.as_ref() == Some(id) {
                    *slot = None;
                }
            }
            Self::ToOneFault => {}
        }
    }

    /// Resolve a to-many fault with the fetched target ids, folding in any
    /// pending edits. No-op on already-resolved holders.
    pub fn resolve_to_many(&mut self, mut fetched: Vec<ObjectId>) {
        if let Self::ToManyFault {
            pending_adds,
            pending_removes,
        } = self
        {
            fetched.retain(|id| !pending_removes.contains(id));
            for id in pending_adds.drain(..) {
                if !fetched.contains(&id) {
                    fetched.push(id);
                }
            }
            *self = Self::ToMany(fetched);
        }
    }

    /// Resolved to-many ids, if resolved.
    pub fn to_many_ids(&self) -> Option<&[ObjectId]> {
        match self {
            Self::ToMany(ids) => Some(ids),
            _ => None,
        }
    }

    /// Resolved to-one target, if resolved.
    pub fn to_one_id(&self) -> Option<Option<&ObjectId>> {
        match self {
            Self::ToOne(slot) => Some(slot.as_ref()),
            _ => None,
        }
    }

    /// Rewrite every occurrence of `old` (including pending edits) to `new`.
    /// Used when a temporary id becomes permanent at commit.
    pub fn replace_id(&mut self, old: &ObjectId, new: &ObjectId) {
        match self {
            Self::ToOne(Some(id)) if id == old => *id = new.clone(),
            Self::ToMany(ids) => {
                for id in ids.iter_mut().filter(|id| *id == old) {
                    *id = new.clone();
                }
            }
            Self::ToManyFault {
                pending_adds,
                pending_removes,
            } => {
                for id in pending_adds.iter_mut().filter(|id| *id == old) {
                    *id = new.clone();
                }
                for id in pending_removes.iter_mut().filter(|id| *id == old) {
                    *id = new.clone();
                }
            }
            _ => {}
        }
    }
}

/// A persistent object: identity, state, attributes, relationship holders.
#[derive(Debug, Clone)]
pub struct DomainObject {
    id: ObjectId,
    state: ObjectState,
    attributes: BTreeMap<String, Value>,
    relationships: BTreeMap<String, RelationshipHolder>,
}

impl DomainObject {
    /// Create a transient object with the given identity.
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            state: ObjectState::Transient,
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
        }
    }

    /// Object identity.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Entity name, via the identity.
    pub fn entity(&self) -> &str {
        self.id.entity()
    }

    /// Lifecycle state.
    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Set the lifecycle state.
    pub fn set_state(&mut self, state: ObjectState) {
        self.state = state;
    }

    /// Replace the identity. Callers must re-key any map holding the object.
    pub fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    /// Read an attribute. `None` for unset attributes; hollow objects must
    /// be inflated by their session before attribute reads.
    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    /// Read an attribute, erroring with a type mismatch description when it
    /// is absent.
    pub fn require(&self, attribute: &str) -> Result<&Value> {
        self.attributes.get(attribute).ok_or_else(|| {
            Error::Mapping(format!(
                "attribute '{attribute}' not set on {}",
                self.id
            ))
        })
    }

    /// Write an attribute without state bookkeeping; the session's
    /// property-change path handles dirtying.
    pub fn set(&mut self, attribute: impl Into<String>, value: Value) {
        self.attributes.insert(attribute.into(), value);
    }

    /// Remove an attribute value (used when a lazy column is invalidated).
    pub fn unset(&mut self, attribute: &str) -> Option<Value> {
        self.attributes.remove(attribute)
    }

    /// All set attributes.
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Clear all attributes (hollowing).
    pub fn clear_attributes(&mut self) {
        self.attributes.clear();
    }

    /// The holder for a relationship, if one has been installed.
    pub fn relationship(&self, name: &str) -> Option<&RelationshipHolder> {
        self.relationships.get(name)
    }

    /// Mutable holder access, installing the given default on first use.
    pub fn relationship_mut(
        &mut self,
        name: &str,
        default: impl FnOnce() -> RelationshipHolder,
    ) -> &mut RelationshipHolder {
        self.relationships
            .entry(name.to_string())
            .or_insert_with(default)
    }

    /// Install a holder, replacing anything already there.
    pub fn set_relationship(&mut self, name: impl Into<String>, holder: RelationshipHolder) {
        self.relationships.insert(name.into(), holder);
    }

    /// All installed relationship holders.
    pub fn relationships(&self) -> &BTreeMap<String, RelationshipHolder> {
        &self.relationships
    }

    /// Rewrite `old` to `new` across every relationship holder.
    pub fn replace_related_id(&mut self, old: &ObjectId, new: &ObjectId) {
        for holder in self.relationships.values_mut() {
            holder.replace_id(old, new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i64) -> ObjectId {
        ObjectId::single("Painting", "id", Value::BigInt(n))
    }

    #[test]
    fn test_state_dirtiness() {
        assert!(ObjectState::New.is_dirty());
        assert!(ObjectState::Modified.is_dirty());
        assert!(ObjectState::Deleted.is_dirty());
        assert!(!ObjectState::Committed.is_dirty());
        assert!(!ObjectState::Hollow.is_dirty());
    }

    #[test]
    fn test_fault_accumulates_pending_edits() {
        let mut holder = RelationshipHolder::to_many_fault();
        holder.add(id(1));
        holder.add(id(2));
        holder.remove(&id(3));
        assert!(holder.is_fault());

        holder.resolve_to_many(vec![id(3), id(4)]);
        let ids = holder.to_many_ids().unwrap();
        assert_eq!(ids, &[id(4), id(1), id(2)]);
    }

    #[test]
    fn test_remove_of_pending_add_cancels_it() {
        let mut holder = RelationshipHolder::to_many_fault();
        holder.add(id(1));
        holder.remove(&id(1));
        holder.resolve_to_many(vec![]);
        assert!(holder.to_many_ids().unwrap().is_empty());
    }

    #[test]
    fn test_add_after_remove_reinstates() {
        let mut holder = RelationshipHolder::to_many_fault();
        holder.remove(&id(1));
        holder.add(id(1));
        holder.resolve_to_many(vec![id(1)]);
        assert_eq!(holder.to_many_ids().unwrap(), &[id(1)]);
    }

    #[test]
    fn test_resolved_list_deduplicates_adds() {
        let mut holder = RelationshipHolder::ToMany(vec![id(1)]);
        holder.add(id(1));
        holder.add(id(2));
        assert_eq!(holder.to_many_ids().unwrap(), &[id(1), id(2)]);
    }

    #[test]
    fn test_to_one_transitions() {
        let mut holder = RelationshipHolder::ToOneFault;
        holder.add(id(9));
        assert_eq!(holder.to_one_id(), Some(Some(&id(9))));
        holder.remove(&id(9));
        assert_eq!(holder.to_one_id(), Some(None));
    }

    #[test]
    fn test_replace_id_rewrites_everywhere() {
        let temp = ObjectId::temporary("Painting");
        let perm = id(42);

        let mut obj = DomainObject::new(id(1));
        obj.set_relationship("cover", RelationshipHolder::ToOne(Some(temp.clone())));
        let mut fault = RelationshipHolder::to_many_fault();
        fault.add(temp.clone());
        obj.set_relationship("gallery", fault);

        obj.replace_related_id(&temp, &perm);
        assert_eq!(
            obj.relationship("cover").unwrap().to_one_id(),
            Some(Some(&perm))
        );
        match obj.relationship("gallery").unwrap() {
            RelationshipHolder::ToManyFault { pending_adds, .. } => {
                assert_eq!(pending_adds, &[perm.clone()]);
            }
            other => panic!("unexpected holder: {other:?}"),
        }
    }

    #[test]
    fn test_require_names_missing_attribute() {
        let obj = DomainObject::new(id(1));
        let err = obj.require("title").unwrap_err();
        assert!(err.to_string().contains("title"));
    }
}
