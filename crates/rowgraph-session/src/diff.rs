//! Graph change log.
//!
//! Every uncommitted mutation in a session is recorded as an ordered
//! [`GraphChange`]. The log is directional and replayable: a
//! [`GraphChangeHandler`] visits changes in recorded order, and applying a
//! log twice must leave the handler's state where one application left it
//! (set-style operations, no increments).

use rowgraph_core::{ObjectId, Value};

/// One node-level change.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphChange {
    /// A new object entered the graph.
    NodeCreated { id: ObjectId },
    /// An object was scheduled for deletion.
    NodeDeleted { id: ObjectId },
    /// A temporary identity was replaced by its permanent form.
    IdChanged { old: ObjectId, new: ObjectId },
    /// An attribute was written.
    PropertySet {
        id: ObjectId,
        property: String,
        new_value: Value,
        old_value: Option<Value>,
    },
    /// A target joined a relationship.
    RelationshipAdded {
        id: ObjectId,
        relationship: String,
        target: ObjectId,
    },
    /// A target left a relationship.
    RelationshipRemoved {
        id: ObjectId,
        relationship: String,
        target: ObjectId,
    },
}

impl GraphChange {
    /// Identity the change applies to.
    pub fn node_id(&self) -> &ObjectId {
        match self {
            GraphChange::NodeCreated { id }
            | GraphChange::NodeDeleted { id }
            | GraphChange::PropertySet { id, .. }
            | GraphChange::RelationshipAdded { id, .. }
            | GraphChange::RelationshipRemoved { id, .. } => id,
            GraphChange::IdChanged { old, .. } => old,
        }
    }
}

/// Visitor over a replayed change log. Methods default to no-ops so
/// handlers implement only what they care about.
pub trait GraphChangeHandler {
    fn node_created(&mut self, _id: &ObjectId) {}
    fn node_deleted(&mut self, _id: &ObjectId) {}
    fn id_changed(&mut self, _old: &ObjectId, _new: &ObjectId) {}
    fn property_set(
        &mut self,
        _id: &ObjectId,
        _property: &str,
        _new_value: &Value,
        _old_value: Option<&Value>,
    ) {
    }
    fn relationship_added(&mut self, _id: &ObjectId, _relationship: &str, _target: &ObjectId) {}
    fn relationship_removed(&mut self, _id: &ObjectId, _relationship: &str, _target: &ObjectId) {}
}

/// Ordered, replayable log of graph changes.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    changes: Vec<GraphChange>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change.
    pub fn record(&mut self, change: GraphChange) {
        self.changes.push(change);
    }

    /// Append every change of another diff, preserving order.
    pub fn append(&mut self, other: Diff) {
        self.changes.extend(other.changes);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphChange> {
        self.changes.iter()
    }

    /// Changes touching one identity, in recorded order.
    pub fn changes_for<'a>(&'a self, id: &'a ObjectId) -> impl Iterator<Item = &'a GraphChange> {
        self.changes.iter().filter(move |c| c.node_id() == id)
    }

    /// Rewrite every reference to `old` (node ids and relationship targets)
    /// to `new`.
    pub fn replace_id(&mut self, old: &ObjectId, new: &ObjectId) {
        for change in &mut self.changes {
            match change {
                GraphChange::NodeCreated { id }
                | GraphChange::NodeDeleted { id }
                | GraphChange::PropertySet { id, .. } => {
                    if id == old {
                        *id = new.clone();
                    }
                }
                GraphChange::RelationshipAdded { id, target, .. }
                | GraphChange::RelationshipRemoved { id, target, .. } => {
                    if id == old {
                        *id = new.clone();
                    }
                    if target == old {
                        *target = new.clone();
                    }
                }
                GraphChange::IdChanged {
                    old: from,
                    new: to,
                } => {
                    if from == old {
                        *from = new.clone();
                    }
                    if to == old {
                        *to = new.clone();
                    }
                }
            }
        }
    }

    /// Replay the log through a handler, in recorded order.
    pub fn replay(&self, handler: &mut dyn GraphChangeHandler) {
        for change in &self.changes {
            match change {
                GraphChange::NodeCreated { id } => handler.node_created(id),
                GraphChange::NodeDeleted { id } => handler.node_deleted(id),
                GraphChange::IdChanged { old, new } => handler.id_changed(old, new),
                GraphChange::PropertySet {
                    id,
                    property,
                    new_value,
                    old_value,
                } => handler.property_set(id, property, new_value, old_value.as_ref()),
                GraphChange::RelationshipAdded {
                    id,
                    relationship,
                    target,
                } => handler.relationship_added(id, relationship, target),
                GraphChange::RelationshipRemoved {
                    id,
                    relationship,
                    target,
                } => handler.relationship_removed(id, relationship, target),
            }
        }
    }

    /// Drop every change touching one identity. Used when an object is
    /// detached from its session with edits pending.
    pub fn remove_changes_for(&mut self, id: &ObjectId) {
        self.changes.retain(|c| c.node_id() != id);
    }

    /// Drop every recorded change.
    pub fn clear(&mut self) {
        self.changes.clear();
    }
}
