//! Object resolution.
//!
//! The resolver turns fully-read result rows back into a graph of
//! registered objects. It never touches the database: the session reads
//! every cursor first (so a timed-out fetch leaves nothing half-written)
//! and hands the row sets here. Resolution walks the translation's
//! segments and secondary plans parents-first, reconciling every row with
//! the session's identity map and attaching prefetched relationships as
//! resolved holders.

use crate::graph_store::{ObjectGraphStore, read_object, write_object};
use rowgraph_core::{
    DomainObject, Entity, Error, ModelRegistry, ObjectHandle, ObjectId, ObjectState,
    RelationshipHolder, Result, Row, Snapshot, Value,
};
use rowgraph_query::{LABEL_SEPARATOR, ROOT_ALIAS, SecondaryFetch, SelectTranslation};
use std::collections::HashMap;
use std::sync::Arc;

/// Everything one resolved fetch produced: root objects in row order and
/// the committed snapshots to fold into the shared cache afterwards.
#[derive(Debug, Default)]
pub struct ResolvedFetch {
    pub roots: Vec<ObjectHandle>,
    pub snapshots: Vec<(ObjectId, Snapshot)>,
}

/// Resolves raw rows into session objects.
pub struct ObjectResolver<'a> {
    registry: &'a ModelRegistry,
    /// Whether fetched data overwrites clean objects and their baselines.
    refreshing: bool,
}

impl<'a> ObjectResolver<'a> {
    pub fn new(registry: &'a ModelRegistry, refreshing: bool) -> Self {
        Self {
            registry,
            refreshing,
        }
    }

    /// Resolve a fetch. `secondary_rows` maps prefetch paths to their fully
    /// read row sets (both disjoint and by-id flavors).
    pub fn resolve(
        &self,
        translation: &SelectTranslation,
        primary_rows: &[Row],
        secondary_rows: &HashMap<String, Vec<Row>>,
        store: &mut ObjectGraphStore,
    ) -> Result<ResolvedFetch> {
        let mut fetch = ResolvedFetch::default();
        // Path -> ordered distinct objects resolved at that path.
        let mut at_path: HashMap<String, Vec<ObjectHandle>> = HashMap::new();
        // (owner id, relationship name) -> ordered distinct child ids,
        // accumulated across fan-out rows.
        let mut to_many: HashMap<(ObjectId, String), Vec<ObjectId>> = HashMap::new();

        for row in primary_rows {
            // Objects resolved from this row, keyed by segment path.
            let mut row_objects: HashMap<&str, Option<(ObjectId, ObjectHandle)>> = HashMap::new();

            for segment in &translation.segments {
                let resolved = self.resolve_row_object(
                    row,
                    &segment.alias,
                    &segment.entity,
                    store,
                    &mut fetch.snapshots,
                )?;
                if let Some((_, handle)) = &resolved {
                    push_distinct(at_path.entry(segment.path.clone()).or_default(), handle);
                    if segment.path.is_empty() {
                        push_distinct(&mut fetch.roots, handle);
                    }
                }

                if let Some(relationship) = &segment.relationship {
                    let parent = row_objects
                        .get(segment.parent_path())
                        .and_then(Option::as_ref);
                    if let Some((parent_id, parent_handle)) = parent {
                        if relationship.is_to_many() {
                            let children = to_many
                                .entry((parent_id.clone(), relationship.name.clone()))
                                .or_default();
                            if let Some((child_id, _)) = &resolved {
                                if !children.contains(child_id) {
                                    children.push(child_id.clone());
                                }
                            }
                        } else {
                            let target = resolved.as_ref().map(|(id, _)| id.clone());
                            self.attach_to_one(parent_handle, &relationship.name, target);
                        }
                    }
                }
                row_objects.insert(segment.path.as_str(), resolved);
            }
        }

        // Joint to-many holders become resolved lists, empty included.
        for segment in &translation.segments {
            let Some(relationship) = &segment.relationship else {
                continue;
            };
            if !relationship.is_to_many() {
                continue;
            }
            let parents = at_path
                .get(segment.parent_path())
                .cloned()
                .unwrap_or_default();
            for parent in parents {
                let parent_id = read_object(&parent).id().clone();
                let children = to_many
                    .remove(&(parent_id, relationship.name.clone()))
                    .unwrap_or_default();
                self.attach_to_many(&parent, &relationship.name, children);
            }
        }

        // Secondary row sets, parents before children.
        for secondary in &translation.secondaries {
            let (path, relationship, entity, link_label) = match secondary {
                SecondaryFetch::Disjoint {
                    path,
                    relationship,
                    entity,
                    link_label,
                    ..
                }
                | SecondaryFetch::ById {
                    path,
                    relationship,
                    entity,
                    link_label,
                } => (path, relationship, entity, link_label),
            };
            let rows = secondary_rows.get(path).map_or(&[][..], Vec::as_slice);
            let parent_path = path.rsplit_once('.').map_or("", |(parent, _)| parent);
            let parents = at_path.get(parent_path).cloned().unwrap_or_default();

            // Child rows partitioned by their owner-linking value.
            let mut by_link: HashMap<Value, Vec<ObjectId>> = HashMap::new();
            let mut resolved_children = Vec::new();
            for row in rows {
                let Some((id, handle)) = self.resolve_row_object(
                    row,
                    ROOT_ALIAS,
                    entity,
                    store,
                    &mut fetch.snapshots,
                )?
                else {
                    continue;
                };
                let link = row.get_by_name(link_label).cloned().ok_or_else(|| {
                    Error::result_shape(format!(
                        "prefetch rows for '{path}' lack link column '{link_label}'"
                    ))
                })?;
                let bucket = by_link.entry(link).or_default();
                if !bucket.contains(&id) {
                    bucket.push(id.clone());
                }
                push_distinct(&mut resolved_children, &handle);
            }
            at_path.insert(path.clone(), resolved_children);

            for parent in &parents {
                let parent_id = read_object(parent).id().clone();
                if relationship.is_to_many() {
                    // Owner side carries its PK, child rows carry the FK.
                    let owner_key = parent_id
                        .key_value(&relationship.joined_pk_column)
                        .cloned()
                        .unwrap_or(Value::Null);
                    let children = by_link.remove(&owner_key).unwrap_or_default();
                    self.attach_to_many(parent, &relationship.name, children);
                } else {
                    // Owner side carries the FK; read it from the baseline.
                    let owner_fk = store
                        .baseline(&parent_id)
                        .and_then(|s| s.get(&relationship.fk_column))
                        .cloned();
                    let target = match owner_fk {
                        Some(Value::Null) | None => None,
                        Some(key) => by_link.get(&key).and_then(|ids| ids.first()).cloned(),
                    };
                    self.attach_to_one(parent, &relationship.name, target);
                }
            }
        }

        Ok(fetch)
    }

    /// Resolve a flat row set fetched for a single entity under the root
    /// alias, as produced by a relationship-fault SELECT. Returns ids and
    /// handles in row order, with snapshots collected for the shared cache.
    pub fn resolve_rows(
        &self,
        entity: &Arc<Entity>,
        rows: &[Row],
        store: &mut ObjectGraphStore,
    ) -> Result<ResolvedFetch> {
        let mut fetch = ResolvedFetch::default();
        for row in rows {
            if let Some((_, handle)) =
                self.resolve_row_object(row, ROOT_ALIAS, entity, store, &mut fetch.snapshots)?
            {
                push_distinct(&mut fetch.roots, &handle);
            }
        }
        Ok(fetch)
    }

    /// Build the snapshot and object for one row's column block. Returns
    /// `None` when the block is an outer-join miss (all PK columns null).
    fn resolve_row_object(
        &self,
        row: &Row,
        alias: &str,
        fetch_entity: &Arc<Entity>,
        store: &mut ObjectGraphStore,
        snapshots: &mut Vec<(ObjectId, Snapshot)>,
    ) -> Result<Option<(ObjectId, ObjectHandle)>> {
        let mut key_pairs = Vec::new();
        let mut missing = true;
        for column in fetch_entity.pk_columns() {
            let label = format!("{alias}{LABEL_SEPARATOR}{column}");
            let value = row.get_by_name(&label).cloned().unwrap_or(Value::Null);
            if value != Value::Null {
                missing = false;
            }
            key_pairs.push((column.to_string(), value));
        }
        if missing {
            return Ok(None);
        }

        // Polymorphism: the discriminator column picks the concrete entity.
        let concrete = match &fetch_entity.inheritance {
            Some(inheritance) => {
                let label = format!(
                    "{alias}{LABEL_SEPARATOR}{}",
                    inheritance.discriminator_column
                );
                let discriminator = row.get_by_name(&label).cloned().unwrap_or(Value::Null);
                match inheritance.resolve(&discriminator) {
                    Some(entity) => self.registry.require(entity)?,
                    None => Arc::clone(fetch_entity),
                }
            }
            None => Arc::clone(fetch_entity),
        };

        let id = ObjectId::new(concrete.name.clone(), key_pairs);

        // Committed-state snapshot: fetched columns resolved, everything
        // the concrete entity maps but this SELECT did not carry marked
        // unresolved.
        let mut snapshot = Snapshot::new();
        for column in fetch_entity.fetched_columns() {
            let label = format!("{alias}{LABEL_SEPARATOR}{column}");
            let value = row.get_by_name(&label).cloned().unwrap_or(Value::Null);
            snapshot.set(column, value);
        }
        for attribute in &concrete.attributes {
            if snapshot.get(&attribute.column).is_none()
                && !snapshot.is_unresolved(&attribute.column)
            {
                snapshot.set_unresolved(attribute.column.clone());
            }
        }

        let handle = match store.get(&id) {
            Some(existing) => {
                let state = read_object(&existing).state();
                match state {
                    ObjectState::Hollow => {
                        self.apply_snapshot(&existing, &concrete, &snapshot);
                        store.set_baseline(id.clone(), snapshot.clone());
                    }
                    ObjectState::Committed if self.refreshing => {
                        self.apply_snapshot(&existing, &concrete, &snapshot);
                        store.set_baseline(id.clone(), snapshot.clone());
                    }
                    // Local edits win over fetched data; only the baseline
                    // moves, so the next diff is computed against what the
                    // database holds now.
                    ObjectState::Modified | ObjectState::Deleted if self.refreshing => {
                        store.set_baseline(id.clone(), snapshot.clone());
                    }
                    _ => {}
                }
                existing
            }
            None => {
                let mut object = DomainObject::new(id.clone());
                object.set_state(ObjectState::Committed);
                let handle = store.register_node(object);
                self.apply_snapshot(&handle, &concrete, &snapshot);
                store.set_baseline(id.clone(), snapshot.clone());
                handle
            }
        };

        snapshots.push((id.clone(), snapshot));
        Ok(Some((id, handle)))
    }

    fn apply_snapshot(&self, handle: &ObjectHandle, entity: &Entity, snapshot: &Snapshot) {
        let mut object = write_object(handle);
        object.clear_attributes();
        for attribute in &entity.attributes {
            if let Some(value) = snapshot.get(&attribute.column) {
                object.set(attribute.name.clone(), value.clone());
            }
        }
        for relationship in &entity.relationships {
            if object.relationship(&relationship.name).is_none() {
                let fault = if relationship.is_to_many() {
                    RelationshipHolder::to_many_fault()
                } else {
                    RelationshipHolder::ToOneFault
                };
                object.set_relationship(relationship.name.clone(), fault);
            }
        }
        object.set_state(ObjectState::Committed);
    }

    fn attach_to_many(&self, parent: &ObjectHandle, relationship: &str, children: Vec<ObjectId>) {
        let mut object = write_object(parent);
        let dirty = object.state().is_dirty();
        let holder = object.relationship_mut(relationship, RelationshipHolder::to_many_fault);
        if holder.is_fault() {
            holder.resolve_to_many(children);
        } else if !dirty {
            *holder = RelationshipHolder::ToMany(children);
        }
    }

    fn attach_to_one(&self, parent: &ObjectHandle, relationship: &str, target: Option<ObjectId>) {
        let mut object = write_object(parent);
        let dirty = object.state().is_dirty();
        let holder = object.relationship_mut(relationship, || RelationshipHolder::ToOneFault);
        if holder.is_fault() || !dirty {
            *holder = RelationshipHolder::ToOne(target);
        }
    }
}

fn push_distinct(list: &mut Vec<ObjectHandle>, handle: &ObjectHandle) {
    if !list.iter().any(|h| Arc::ptr_eq(h, handle)) {
        list.push(Arc::clone(handle));
    }
}
