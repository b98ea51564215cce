//! Session and unit of work for rowgraph.
//!
//! `rowgraph-session` is the **unit-of-work layer**. It coordinates object
//! identity, change tracking, and transactional persistence on top of the
//! mapping metadata and client traits from `rowgraph-core` and the SQL
//! translation from `rowgraph-query`.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per identity per session
//!   ([`ObjectGraphStore`]).
//! - **Change tracking**: every mutation lands in an ordered, replayable
//!   [`Diff`] before commit.
//! - **Shared snapshot cache**: committed row state lives in a bounded LRU
//!   [`RowCache`] shared by all sessions of a [`Domain`].
//! - **Transactional safety**: [`CommitPlanner`] wraps the whole change set
//!   in one client transaction; the first failure rolls everything back.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: nothing is flushed until `commit_changes`.
//! - **Ownership clarity**: a session owns its objects; peers only ever see
//!   committed snapshots through the shared cache.
//! - **Synchronous core**: every operation completes or fails on the calling
//!   thread; only peer notification rides a background channel.
//!
//! # Example
//!
//! ```ignore
//! let domain = Arc::new(Domain::builder(registry, client).build());
//! let mut session = Session::new(&domain);
//!
//! let artist = session.create_object("Artist")?;
//! session.set_property(&artist, "name", Value::Text("Dali".into()))?;
//! session.commit_changes()?;
//!
//! let fetched = session.perform(
//!     &ObjectQuery::new("Artist").filter(Expr::path("name").eq("Dali")),
//! )?;
//! ```

pub mod commit;
pub mod diff;
pub mod event;
pub mod graph_store;
pub mod resolver;
pub mod row_cache;

pub use commit::{CommitOutcome, CommitPlan, CommitPlanner};
pub use diff::{Diff, GraphChange, GraphChangeHandler};
pub use event::EventChannel;
pub use graph_store::{ObjectGraphStore, read_object, write_object};
pub use resolver::{ObjectResolver, ResolvedFetch};
pub use row_cache::{CacheChange, CacheListener, RowCache};

use rowgraph_core::{
    CounterKeyGenerator, DbClient, DeleteRule, DomainObject, Entity, Error, FaultError,
    FaultErrorKind, KeyGenerator, ModelRegistry, ObjectHandle, ObjectId, ObjectState,
    RelationshipHolder, Result, Row, Snapshot, ValidationError, Value, fetch_all,
};
use rowgraph_query::{
    AttributeFaultQuery, Dialect, LABEL_SEPARATOR, ObjectQuery, QueryTranslator, ROOT_ALIAS,
    SecondaryFetch, SelectTranslation, SqlStatement, TranslationCache, cache_key,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::debug;

/// Validation callbacks may write through the object and may create or
/// modify other objects via their session; commit re-runs them until the
/// dirty set stops growing.
pub type Validator = Box<dyn Fn(&mut DomainObject, &mut ValidationError) + Send + Sync>;

/// Commit re-runs validation at most this many times before accepting the
/// dirty set as stable.
const VALIDATION_ROUNDS: usize = 8;

/// Shared per-stack state: mapping metadata, database access, the snapshot
/// cache, and the pieces every session borrows.
pub struct Domain {
    registry: Arc<ModelRegistry>,
    client: Arc<dyn DbClient>,
    keys: Arc<dyn KeyGenerator>,
    cache: Arc<RowCache>,
    events: EventChannel,
    dialect: Dialect,
    statements: Mutex<TranslationCache>,
}

impl Domain {
    pub fn builder(registry: ModelRegistry, client: Arc<dyn DbClient>) -> DomainBuilder {
        DomainBuilder {
            registry,
            client,
            keys: None,
            dialect: Dialect::default(),
            cache_capacity: row_cache::DEFAULT_CAPACITY,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<RowCache> {
        &self.cache
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Block until every cache change posted so far is visible to peers.
    pub fn drain_events(&self, timeout: std::time::Duration) -> bool {
        self.events.drain(timeout)
    }

    /// Translate through the bounded statement cache.
    fn translation(&self, query: &ObjectQuery) -> Result<Arc<SelectTranslation>> {
        let key = cache_key(query);
        let mut statements = self
            .statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        statements.get_or_insert(key, || {
            QueryTranslator::new(&self.registry, self.dialect).translate(query)
        })
    }
}

pub struct DomainBuilder {
    registry: ModelRegistry,
    client: Arc<dyn DbClient>,
    keys: Option<Arc<dyn KeyGenerator>>,
    dialect: Dialect,
    cache_capacity: usize,
}

impl DomainBuilder {
    #[must_use]
    pub fn key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = Some(keys);
        self
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    #[must_use]
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn build(self) -> Domain {
        let cache = Arc::new(RowCache::new(self.cache_capacity));
        let events = EventChannel::new(Arc::clone(&cache));
        Domain {
            registry: Arc::new(self.registry),
            client: self.client,
            keys: self
                .keys
                .unwrap_or_else(|| Arc::new(CounterKeyGenerator::starting_at(1))),
            cache,
            events,
            dialect: self.dialect,
            statements: Mutex::new(TranslationCache::default()),
        }
    }
}

/// Queue of peer cache changes, filled synchronously by the cache and
/// drained by the owning session at its next operation boundary.
struct PeerChanges {
    queue: Mutex<Vec<CacheChange>>,
}

impl CacheListener for PeerChanges {
    fn cache_changed(&self, change: &CacheChange) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change.clone());
    }
}

/// One unit of work over a [`Domain`].
pub struct Session {
    domain: Arc<Domain>,
    store: ObjectGraphStore,
    peer_changes: Arc<PeerChanges>,
    validators: Vec<Validator>,
}

impl Session {
    pub fn new(domain: &Arc<Domain>) -> Self {
        let peer_changes = Arc::new(PeerChanges {
            queue: Mutex::new(Vec::new()),
        });
        domain
            .cache
            .add_listener(Arc::clone(&peer_changes) as Arc<dyn CacheListener>);
        Self {
            domain: Arc::clone(domain),
            store: ObjectGraphStore::new(),
            peer_changes,
            validators: Vec::new(),
        }
    }

    /// A child unit of work over the same domain. The child reads through
    /// to this session via [`Session::local_object`] and pushes its changes
    /// up with [`Session::commit_changes_to_parent`].
    pub fn nested(&self) -> Session {
        Session::new(&self.domain)
    }

    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    pub fn store(&self) -> &ObjectGraphStore {
        &self.store
    }

    pub fn has_changes(&self) -> bool {
        self.store.has_changes()
    }

    /// Register a validation callback run during commit.
    pub fn add_validator(&mut self, validator: Validator) {
        self.validators.push(validator);
    }

    // ---- object lifecycle ------------------------------------------------

    /// Create a new object with a temporary identity. It is inserted on the
    /// next successful commit.
    pub fn create_object(&mut self, entity: &str) -> Result<ObjectHandle> {
        let entity = self.domain.registry.require(entity)?;
        let id = ObjectId::temporary(entity.name.clone());
        let mut object = DomainObject::new(id.clone());
        object.set_state(ObjectState::New);
        // A brand-new object has nothing related yet: resolved empties, not
        // faults.
        for relationship in &entity.relationships {
            let holder = if relationship.is_to_many() {
                RelationshipHolder::ToMany(Vec::new())
            } else {
                RelationshipHolder::ToOne(None)
            };
            object.set_relationship(relationship.name.clone(), holder);
        }
        let handle = self.store.register_node(object);
        self.store.record(GraphChange::NodeCreated { id });
        Ok(handle)
    }

    /// Read an attribute, firing the row fault (HOLLOW object) or the lazy
    /// attribute fault if needed.
    pub fn get_property(&mut self, handle: &ObjectHandle, attribute: &str) -> Result<Value> {
        let (id, state, entity_name) = {
            let object = read_object(handle);
            (
                object.id().clone(),
                object.state(),
                object.entity().to_string(),
            )
        };
        if state == ObjectState::Hollow {
            self.resolve_hollow(&id)?;
        }
        if let Some(value) = read_object(handle).get(attribute) {
            return Ok(value.clone());
        }

        let entity = self.domain.registry.require(&entity_name)?;
        let lazy = entity
            .attribute_named(attribute)
            .is_some_and(|a| a.lazy && !matches!(state, ObjectState::New | ObjectState::Transient));
        if lazy {
            return self.fire_attribute_fault(handle, &entity, attribute);
        }
        Ok(Value::Null)
    }

    /// Write an attribute, retaining the baseline snapshot on the first
    /// modification and recording the change in the diff.
    pub fn set_property(
        &mut self,
        handle: &ObjectHandle,
        attribute: &str,
        value: Value,
    ) -> Result<()> {
        self.mark_dirty(handle)?;
        let (id, old_value) = {
            let mut object = write_object(handle);
            let old = object.get(attribute).cloned();
            object.set(attribute.to_string(), value.clone());
            (object.id().clone(), old)
        };
        self.store.record(GraphChange::PropertySet {
            id,
            property: attribute.to_string(),
            new_value: value,
            old_value,
        });
        Ok(())
    }

    /// Resolved target ids of a relationship, firing its fault if needed.
    pub fn related_ids(
        &mut self,
        handle: &ObjectHandle,
        relationship: &str,
    ) -> Result<Vec<ObjectId>> {
        self.resolve_relationship(handle, relationship)?;
        let object = read_object(handle);
        Ok(match object.relationship(relationship) {
            Some(RelationshipHolder::ToMany(ids)) => ids.clone(),
            Some(RelationshipHolder::ToOne(Some(id))) => vec![id.clone()],
            _ => Vec::new(),
        })
    }

    /// Connect `target` through `relationship`, maintaining the reverse
    /// holder when one is mapped.
    pub fn add_related(
        &mut self,
        handle: &ObjectHandle,
        relationship: &str,
        target: &ObjectHandle,
    ) -> Result<()> {
        let entity = self.entity_of(handle)?;
        let mapped = entity.relationship_named(relationship).ok_or_else(|| {
            Error::Mapping(format!(
                "entity '{}' has no relationship '{relationship}'",
                entity.name
            ))
        })?;
        let to_many = mapped.is_to_many();
        let reverse = mapped.reverse.clone();

        self.mark_dirty(handle)?;
        self.mark_dirty(target)?;

        let (owner_id, target_id) = (
            read_object(handle).id().clone(),
            read_object(target).id().clone(),
        );
        {
            let mut owner = write_object(handle);
            let holder = owner.relationship_mut(relationship, || {
                if to_many {
                    RelationshipHolder::to_many_fault()
                } else {
                    RelationshipHolder::ToOneFault
                }
            });
            holder.add(target_id.clone());
        }
        if let Some(reverse) = reverse {
            let mut other = write_object(target);
            let holder = other.relationship_mut(&reverse, || {
                if to_many {
                    // Reverse of a to-many is the target's to-one.
                    RelationshipHolder::ToOneFault
                } else {
                    RelationshipHolder::to_many_fault()
                }
            });
            holder.add(owner_id.clone());
        }
        self.store.record(GraphChange::RelationshipAdded {
            id: owner_id,
            relationship: relationship.to_string(),
            target: target_id,
        });
        Ok(())
    }

    /// Disconnect `target` from `relationship`, maintaining the reverse.
    pub fn remove_related(
        &mut self,
        handle: &ObjectHandle,
        relationship: &str,
        target: &ObjectHandle,
    ) -> Result<()> {
        let entity = self.entity_of(handle)?;
        let reverse = entity
            .relationship_named(relationship)
            .and_then(|r| r.reverse.clone());

        self.mark_dirty(handle)?;
        self.mark_dirty(target)?;

        let (owner_id, target_id) = (
            read_object(handle).id().clone(),
            read_object(target).id().clone(),
        );
        {
            let mut owner = write_object(handle);
            if owner.relationships().contains_key(relationship) {
                owner
                    .relationship_mut(relationship, RelationshipHolder::to_many_fault)
                    .remove(&target_id);
            }
        }
        if let Some(reverse) = reverse {
            let mut other = write_object(target);
            if other.relationships().contains_key(&reverse) {
                other
                    .relationship_mut(&reverse, RelationshipHolder::to_many_fault)
                    .remove(&owner_id);
            }
        }
        self.store.record(GraphChange::RelationshipRemoved {
            id: owner_id,
            relationship: relationship.to_string(),
            target: target_id,
        });
        Ok(())
    }

    /// Schedule an object for deletion, applying the mapped delete rules.
    ///
    /// `Deny` is checked across all relationships before anything mutates;
    /// `Cascade` deletes targets transitively; `Nullify` clears the reverse
    /// holders; `NoAction` leaves targets alone. New objects simply detach.
    pub fn delete_object(&mut self, handle: &ObjectHandle) -> Result<()> {
        let id = read_object(handle).id().clone();
        let entity = self.entity_of(handle)?;

        // Deny first, before any graph mutation or SQL.
        for relationship in &entity.relationships {
            if relationship.delete_rule == DeleteRule::Deny
                && !self.related_ids(handle, &relationship.name)?.is_empty()
            {
                return Err(Error::DeleteDenied {
                    id,
                    relationship: relationship.name.clone(),
                });
            }
        }

        for relationship in entity.relationships.clone() {
            match relationship.delete_rule {
                DeleteRule::Cascade => {
                    for target_id in self.related_ids(handle, &relationship.name)? {
                        if let Some(target) = self.store.get(&target_id) {
                            if read_object(&target).state() != ObjectState::Deleted {
                                self.delete_object(&target)?;
                            }
                        }
                    }
                }
                DeleteRule::Nullify => {
                    for target_id in self.related_ids(handle, &relationship.name)? {
                        if let Some(target) = self.store.get(&target_id) {
                            self.remove_related(handle, &relationship.name, &target)?;
                        }
                    }
                }
                DeleteRule::Deny | DeleteRule::NoAction => {}
            }
        }

        let was_new = read_object(handle).state() == ObjectState::New;
        if was_new {
            // Never persisted: detaching is the whole deletion.
            self.store.unregister(&[id]);
            return Ok(());
        }
        self.mark_dirty(handle)?;
        write_object(handle).set_state(ObjectState::Deleted);
        self.store.record(GraphChange::NodeDeleted { id });
        Ok(())
    }

    /// Invalidate objects: back to HOLLOW, snapshots dropped, next access
    /// refetches.
    pub fn invalidate(&mut self, ids: &[ObjectId]) {
        self.store.invalidate(ids);
    }

    /// The local counterpart of an object known to `parent` (or to the
    /// shared cache). Copies committed state on first need; otherwise a
    /// HOLLOW stand-in sharing the identity.
    pub fn local_object(&mut self, parent: Option<&Session>, id: &ObjectId) -> ObjectHandle {
        if let Some(existing) = self.store.get(id) {
            return existing;
        }
        if let Some(source) = parent.and_then(|p| p.store.get(id)) {
            let source = read_object(&source);
            let mut copy = DomainObject::new(id.clone());
            for (name, value) in source.attributes() {
                copy.set(name.clone(), value.clone());
            }
            for (name, holder) in source.relationships() {
                copy.set_relationship(name.clone(), holder.clone());
            }
            copy.set_state(match source.state() {
                ObjectState::Hollow => ObjectState::Hollow,
                _ => ObjectState::Committed,
            });
            let handle = self.store.register_node(copy);
            if let Some(baseline) = parent.and_then(|p| p.store.baseline(id)) {
                self.store.set_baseline(id.clone(), baseline.clone());
            }
            return handle;
        }
        if let Some(snapshot) = self.domain.cache.get(id) {
            if let Ok(entity) = self.domain.registry.require(id.entity()) {
                let mut object = DomainObject::new(id.clone());
                apply_snapshot_values(&mut object, &entity, &snapshot);
                object.set_state(ObjectState::Committed);
                let handle = self.store.register_node(object);
                self.store.set_baseline(id.clone(), snapshot);
                return handle;
            }
        }
        let mut hollow = DomainObject::new(id.clone());
        hollow.set_state(ObjectState::Hollow);
        self.store.register_node(hollow)
    }

    // ---- fetching --------------------------------------------------------

    /// Execute an object query: translate (through the statement cache),
    /// read every row set, then resolve into this session's graph. Caches
    /// are only touched after all rows are in, so a timeout leaves them
    /// clean.
    pub fn perform(&mut self, query: &ObjectQuery) -> Result<Vec<ObjectHandle>> {
        self.apply_peer_changes();
        let started = Instant::now();
        let translation = self.domain.translation(query)?;

        let primary = self.read_rows(&translation.statement, query, started)?;
        let mut rows_by_path: HashMap<String, Vec<Row>> = HashMap::new();

        for secondary in &translation.secondaries {
            match secondary {
                SecondaryFetch::Disjoint {
                    path, statement, ..
                } => {
                    let rows = self.read_rows(statement, query, started)?;
                    rows_by_path.insert(path.clone(), rows);
                }
                SecondaryFetch::ById {
                    path, relationship, ..
                } => {
                    let parent_path = path.rsplit_once('.').map_or("", |(parent, _)| parent);
                    let parent_alias = translation
                        .segments
                        .iter()
                        .find(|s| s.path == parent_path)
                        .map_or(ROOT_ALIAS, |s| s.alias.as_str());
                    let parent_rows = if parent_path.is_empty() {
                        &primary
                    } else {
                        rows_by_path.get(parent_path).map_or(&[][..], Vec::as_slice)
                    };
                    let owner_column = if relationship.is_to_many() {
                        &relationship.joined_pk_column
                    } else {
                        &relationship.fk_column
                    };
                    let label = format!("{parent_alias}{LABEL_SEPARATOR}{owner_column}");
                    let mut owner_keys: Vec<Value> = Vec::new();
                    for row in parent_rows {
                        match row.get_by_name(&label) {
                            Some(Value::Null) | None => {}
                            Some(key) => {
                                if !owner_keys.contains(key) {
                                    owner_keys.push(key.clone());
                                }
                            }
                        }
                    }
                    let rows = if owner_keys.is_empty() {
                        Vec::new()
                    } else {
                        let statement =
                            QueryTranslator::new(&self.domain.registry, self.domain.dialect)
                                .by_id_statement(relationship, &owner_keys)?;
                        self.read_rows(&statement, query, started)?
                    };
                    rows_by_path.insert(path.clone(), rows);
                }
            }
        }

        let resolver = ObjectResolver::new(&self.domain.registry, query.refreshing);
        let fetch = resolver.resolve(&translation, &primary, &rows_by_path, &mut self.store)?;
        self.fold_snapshots(fetch.snapshots, query.refreshing);
        Ok(fetch.roots)
    }

    /// Apply queued peer cache changes to local clean objects. Local
    /// uncommitted edits always win.
    pub fn apply_peer_changes(&mut self) {
        let changes: Vec<CacheChange> = self
            .peer_changes
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for change in changes {
            for (id, snapshot) in change.added.iter().chain(change.updated.iter()) {
                let Some(handle) = self.store.get(id) else {
                    continue;
                };
                if read_object(&handle).state() != ObjectState::Committed {
                    continue;
                }
                if let Ok(entity) = self.domain.registry.require(id.entity()) {
                    let mut object = write_object(&handle);
                    apply_snapshot_values(&mut object, &entity, snapshot);
                    drop(object);
                    self.store.set_baseline(id.clone(), snapshot.clone());
                }
            }
            for id in change.deleted.iter().chain(change.invalidated.iter()) {
                let Some(handle) = self.store.get(id) else {
                    continue;
                };
                if read_object(&handle).state() == ObjectState::Committed {
                    self.store.invalidate(std::slice::from_ref(id));
                }
            }
        }
    }

    // ---- commit / rollback ----------------------------------------------

    /// Commit all pending changes in one transaction.
    ///
    /// Runs validation to a fixed point, plans and executes the row
    /// operations, replaces temporary ids everywhere, finalizes object
    /// states, and posts the resulting snapshots to the shared cache. On
    /// failure nothing changes and the diff stays pending.
    pub fn commit_changes(&mut self) -> Result<()> {
        self.validate_for_commit()?;

        let planner = CommitPlanner::new(&self.domain.registry, self.domain.dialect);
        let plan = planner.plan(&self.store)?;
        if plan.is_empty() {
            self.store.clear_diff();
            return Ok(());
        }
        let outcome = planner.execute(
            plan,
            self.domain.client.as_ref(),
            self.domain.keys.as_ref(),
        )?;

        for (old, new) in &outcome.id_mapping {
            self.store.process_id_change(old, new);
        }

        let mut removed = Vec::new();
        for handle in self.store.dirty_objects() {
            let mut object = write_object(&handle);
            match object.state() {
                ObjectState::New | ObjectState::Modified => {
                    object.set_state(ObjectState::Committed);
                }
                ObjectState::Deleted => removed.push(object.id().clone()),
                _ => {}
            }
        }
        for id in &removed {
            self.store.remove(id);
        }
        for (id, snapshot) in outcome.change.added.iter().chain(outcome.change.updated.iter()) {
            self.store.set_baseline(id.clone(), snapshot.clone());
        }
        self.store.clear_diff();

        debug!(
            inserted = outcome.change.added.len(),
            updated = outcome.change.updated.len(),
            deleted = outcome.change.deleted.len(),
            "committed changes"
        );
        self.domain.events.post(outcome.change);
        Ok(())
    }

    /// Push this session's changes into `parent` without touching the
    /// database or the shared cache. The parent commits them later.
    pub fn commit_changes_to_parent(&mut self, parent: &mut Session) -> Result<()> {
        self.validate_for_commit()?;

        let mut removed = Vec::new();
        for handle in self.store.dirty_objects() {
            let source = read_object(&handle);
            let id = source.id().clone();
            match source.state() {
                ObjectState::New => {
                    let mut copy = DomainObject::new(id.clone());
                    copy_contents(&source, &mut copy);
                    copy.set_state(ObjectState::New);
                    drop(source);
                    parent.store.register_node(copy);
                    write_object(&handle).set_state(ObjectState::Committed);
                }
                ObjectState::Modified => {
                    if let Some(target) = parent.store.get(&id) {
                        parent.mark_dirty(&target)?;
                        let mut object = write_object(&target);
                        copy_contents(&source, &mut object);
                        object.set_state(ObjectState::Modified);
                    } else {
                        let mut copy = DomainObject::new(id.clone());
                        copy_contents(&source, &mut copy);
                        copy.set_state(ObjectState::Modified);
                        parent.store.register_node(copy);
                        if let Some(baseline) = self.store.baseline(&id) {
                            parent.store.retain_snapshot(&id, baseline.clone());
                        }
                    }
                    drop(source);
                    write_object(&handle).set_state(ObjectState::Committed);
                    // The parent now holds the pending delta; locally the
                    // values are the new baseline.
                    if let Ok(entity) = self.domain.registry.require(id.entity()) {
                        let snapshot = object_snapshot(&read_object(&handle), &entity);
                        self.store.set_baseline(id.clone(), snapshot);
                    }
                }
                ObjectState::Deleted => {
                    drop(source);
                    if let Some(target) = parent.store.get(&id) {
                        parent.mark_dirty(&target)?;
                        write_object(&target).set_state(ObjectState::Deleted);
                    } else {
                        let mut copy = DomainObject::new(id.clone());
                        copy.set_state(ObjectState::Deleted);
                        parent.store.register_node(copy);
                    }
                    parent
                        .store
                        .record(GraphChange::NodeDeleted { id: id.clone() });
                    removed.push(id);
                }
                _ => {}
            }
        }
        for id in &removed {
            self.store.remove(id);
        }
        let diff = self.store.take_diff();
        parent.store.append_diff(diff);
        Ok(())
    }

    /// Discard every uncommitted change. New objects detach; modified and
    /// deleted objects return to their committed values.
    pub fn rollback_changes(&mut self) -> Result<()> {
        let mut detached = Vec::new();
        for handle in self.store.dirty_objects() {
            let (id, state, entity_name) = {
                let object = read_object(&handle);
                (
                    object.id().clone(),
                    object.state(),
                    object.entity().to_string(),
                )
            };
            match state {
                ObjectState::New => detached.push(id),
                ObjectState::Modified | ObjectState::Deleted => {
                    let entity = self.domain.registry.require(&entity_name)?;
                    let baseline = self.store.baseline(&id).cloned();
                    let mut object = write_object(&handle);
                    object.clear_attributes();
                    if let Some(baseline) = &baseline {
                        apply_snapshot_values(&mut object, &entity, baseline);
                    }
                    // Relationship edits are not snapshotted: fall back to
                    // faults and refetch on next access.
                    for relationship in &entity.relationships {
                        let holder = if relationship.is_to_many() {
                            RelationshipHolder::to_many_fault()
                        } else {
                            RelationshipHolder::ToOneFault
                        };
                        object.set_relationship(relationship.name.clone(), holder);
                    }
                    object.set_state(if baseline.is_some() {
                        ObjectState::Committed
                    } else {
                        ObjectState::Hollow
                    });
                }
                _ => {}
            }
        }
        self.store.unregister(&detached);
        self.store.clear_diff();
        Ok(())
    }

    // ---- internals -------------------------------------------------------

    fn entity_of(&self, handle: &ObjectHandle) -> Result<Arc<Entity>> {
        let name = read_object(handle).entity().to_string();
        self.domain.registry.require(&name)
    }

    /// Retain the pre-modification snapshot and flip COMMITTED to MODIFIED.
    fn mark_dirty(&mut self, handle: &ObjectHandle) -> Result<()> {
        let (id, state) = {
            let object = read_object(handle);
            (object.id().clone(), object.state())
        };
        if matches!(state, ObjectState::Committed | ObjectState::Hollow) {
            let entity = self.entity_of(handle)?;
            let snapshot = object_snapshot(&read_object(handle), &entity);
            self.store.retain_snapshot(&id, snapshot);
            write_object(handle).set_state(ObjectState::Modified);
        }
        Ok(())
    }

    /// Fetch the full row for a HOLLOW object. The object stays HOLLOW if
    /// the row is gone.
    fn resolve_hollow(&mut self, id: &ObjectId) -> Result<()> {
        if id.is_temporary() {
            return Err(Error::Fault(FaultError {
                id: id.clone(),
                member: None,
                kind: FaultErrorKind::UnresolvableTemporaryId,
            }));
        }
        let roots = self.perform(&ObjectQuery::for_id(id))?;
        if roots.is_empty() {
            return Err(Error::Fault(FaultError {
                id: id.clone(),
                member: None,
                kind: FaultErrorKind::RowMissing,
            }));
        }
        Ok(())
    }

    /// Targeted single-row fetch of one lazy column.
    fn fire_attribute_fault(
        &mut self,
        handle: &ObjectHandle,
        entity: &Entity,
        attribute: &str,
    ) -> Result<Value> {
        let id = read_object(handle).id().clone();
        let column = entity
            .attribute_named(attribute)
            .map(|a| a.column.clone())
            .ok_or_else(|| {
                Error::Mapping(format!(
                    "entity '{}' has no attribute '{attribute}'",
                    entity.name
                ))
            })?;
        let translator = QueryTranslator::new(&self.domain.registry, self.domain.dialect);
        let statement = translator.attribute_fault_statement(&AttributeFaultQuery {
            id: id.clone(),
            column: column.clone(),
        })?;
        let mut cursor = self
            .domain
            .client
            .select(&statement.sql, &statement.params)?;
        let Some(row) = cursor.next_row()? else {
            return Err(Error::Fault(FaultError {
                id,
                member: Some(attribute.to_string()),
                kind: FaultErrorKind::RowMissing,
            }));
        };
        drop(cursor);
        // A missing column is a malformed result, not a NULL: NULL is a
        // legitimate stored value and must stay distinguishable from it.
        let Some(value) = row.get_by_name(&column).cloned() else {
            return Err(Error::result_shape(format!(
                "fault query for '{}.{attribute}' returned no '{column}' column",
                entity.name
            )));
        };
        write_object(handle).set(attribute.to_string(), value.clone());
        if let Some(baseline) = self.store.baseline(&id) {
            let mut updated = baseline.clone();
            updated.set(column.clone(), value.clone());
            self.store.set_baseline(id.clone(), updated);
        }
        let mut patch = Snapshot::new();
        patch.set(column, value.clone());
        self.domain.cache.merge(id, patch);
        Ok(value)
    }

    /// Resolve a relationship fault through the database. To-one faults
    /// resolve without SQL: the FK value names the target identity and a
    /// HOLLOW stand-in is enough.
    fn resolve_relationship(&mut self, handle: &ObjectHandle, relationship: &str) -> Result<()> {
        let entity = self.entity_of(handle)?;
        let mapped = entity.relationship_named(relationship).ok_or_else(|| {
            Error::Mapping(format!(
                "entity '{}' has no relationship '{relationship}'",
                entity.name
            ))
        })?;
        let is_fault = read_object(handle)
            .relationship(relationship)
            .is_none_or(RelationshipHolder::is_fault);
        if !is_fault {
            return Ok(());
        }
        let id = read_object(handle).id().clone();

        if mapped.is_to_many() {
            if id.is_temporary() {
                // Unsaved owner: nothing in the database can point at it.
                write_object(handle)
                    .relationship_mut(relationship, RelationshipHolder::to_many_fault)
                    .resolve_to_many(Vec::new());
                return Ok(());
            }
            let owner_key = id
                .key_value(&mapped.joined_pk_column)
                .or_else(|| id.single_key_value())
                .cloned()
                .ok_or_else(|| {
                    Error::Mapping(format!(
                        "identity {id} lacks key column '{}'",
                        mapped.joined_pk_column
                    ))
                })?;
            let translator = QueryTranslator::new(&self.domain.registry, self.domain.dialect);
            let statement = translator.by_id_statement(mapped, &[owner_key])?;
            let mut cursor = self
                .domain
                .client
                .select(&statement.sql, &statement.params)?;
            let rows = fetch_all(cursor.as_mut())?;
            drop(cursor);
            let target = self.domain.registry.require(&mapped.target)?;
            let resolver = ObjectResolver::new(&self.domain.registry, true);
            let fetch = resolver.resolve_rows(&target, &rows, &mut self.store)?;
            let ids: Vec<ObjectId> = fetch
                .roots
                .iter()
                .map(|h| read_object(h).id().clone())
                .collect();
            self.fold_snapshots(fetch.snapshots, true);
            write_object(handle)
                .relationship_mut(relationship, RelationshipHolder::to_many_fault)
                .resolve_to_many(ids);
        } else {
            let fk_value = read_object(handle)
                .attributes()
                .iter()
                .find(|(name, _)| {
                    entity
                        .attribute_named(name)
                        .is_some_and(|a| a.column == mapped.fk_column)
                })
                .map(|(_, v)| v.clone())
                .or_else(|| {
                    self.store
                        .baseline(&id)
                        .and_then(|s| s.get(&mapped.fk_column))
                        .cloned()
                });
            let holder = match fk_value {
                Some(Value::Null) | None => RelationshipHolder::ToOne(None),
                Some(key) => {
                    let target_id = ObjectId::single(
                        mapped.target.clone(),
                        mapped.joined_pk_column.clone(),
                        key,
                    );
                    self.local_object(None, &target_id);
                    RelationshipHolder::ToOne(Some(target_id))
                }
            };
            write_object(handle).set_relationship(relationship.to_string(), holder);
        }
        Ok(())
    }

    fn validate_for_commit(&mut self) -> Result<()> {
        if self.validators.is_empty() {
            return Ok(());
        }
        for _ in 0..VALIDATION_ROUNDS {
            let dirty = self.store.dirty_objects();
            let before = self.store.diff().len();
            let mut failures = ValidationError::new();
            for handle in &dirty {
                let mut object = write_object(handle);
                for validator in &self.validators {
                    validator(&mut object, &mut failures);
                }
            }
            if !failures.is_empty() {
                return Err(Error::Validation(failures));
            }
            // Callbacks may have edited committed objects directly; pick
            // those edits up so the planner sees them.
            for handle in self.store.objects().cloned().collect::<Vec<_>>() {
                let (id, state) = {
                    let object = read_object(&handle);
                    (object.id().clone(), object.state())
                };
                if state == ObjectState::Committed {
                    let entity = self.entity_of(&handle)?;
                    let current = object_snapshot(&read_object(&handle), &entity);
                    let changed = self
                        .store
                        .baseline(&id)
                        .map(|b| !current.changed_columns(b).is_empty());
                    if changed == Some(true) {
                        write_object(&handle).set_state(ObjectState::Modified);
                    }
                }
            }
            let stable = self.store.diff().len() == before
                && self.store.dirty_objects().len() == dirty.len();
            if stable {
                break;
            }
        }
        Ok(())
    }

    /// Read a statement's rows completely, enforcing the query timeout per
    /// row. Nothing is cached until the whole set is in.
    fn read_rows(
        &self,
        statement: &SqlStatement,
        query: &ObjectQuery,
        started: Instant,
    ) -> Result<Vec<Row>> {
        let mut cursor = self
            .domain
            .client
            .select(&statement.sql, &statement.params)?;
        let mut rows = Vec::new();
        while let Some(row) = cursor.next_row()? {
            if let Some(timeout) = query.timeout {
                if started.elapsed() > timeout {
                    return Err(Error::Timeout);
                }
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn fold_snapshots(&self, snapshots: Vec<(ObjectId, Snapshot)>, refreshing: bool) {
        for (id, snapshot) in snapshots {
            if refreshing || self.domain.cache.version(&id).is_none() {
                self.domain.cache.merge(id, snapshot);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let listener = Arc::clone(&self.peer_changes) as Arc<dyn CacheListener>;
        self.domain.cache.remove_listener(&listener);
    }
}

/// Current attribute values as a snapshot, with lazily mapped columns not
/// yet fetched marked unresolved.
fn object_snapshot(object: &DomainObject, entity: &Entity) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for attribute in &entity.attributes {
        match object.get(&attribute.name) {
            Some(value) => snapshot.set(attribute.column.clone(), value.clone()),
            None if attribute.lazy => snapshot.set_unresolved(attribute.column.clone()),
            None => {}
        }
    }
    snapshot
}

/// Write a snapshot's resolved values into an object's attributes.
fn apply_snapshot_values(object: &mut DomainObject, entity: &Entity, snapshot: &Snapshot) {
    for attribute in &entity.attributes {
        match snapshot.get(&attribute.column) {
            Some(value) => object.set(attribute.name.clone(), value.clone()),
            None => {
                object.unset(&attribute.name);
            }
        }
    }
}

fn copy_contents(source: &DomainObject, target: &mut DomainObject) {
    for (name, value) in source.attributes() {
        target.set(name.clone(), value.clone());
    }
    for (name, holder) in source.relationships() {
        target.set_relationship(name.clone(), holder.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgraph_core::{Attribute, DbTransaction, Relationship, RowCursor};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeClient {
        executed: StdMutex<Vec<String>>,
    }

    impl FakeClient {
        fn log(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    struct EmptyCursor;

    impl RowCursor for EmptyCursor {
        fn next_row(&mut self) -> Result<Option<Row>> {
            Ok(None)
        }
    }

    struct FakeTx<'a> {
        client: &'a FakeClient,
    }

    impl DbTransaction for FakeTx<'_> {
        fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<u64> {
            self.client.executed.lock().unwrap().push(sql.to_string());
            Ok(1)
        }

        fn commit(self: Box<Self>) -> Result<()> {
            Ok(())
        }

        fn rollback(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    impl DbClient for FakeClient {
        fn select<'a>(&'a self, _sql: &str, _params: &[Value]) -> Result<Box<dyn RowCursor + 'a>> {
            Ok(Box::new(EmptyCursor))
        }

        fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
            self.executed.lock().unwrap().push(sql.to_string());
            Ok(1)
        }

        fn begin<'a>(&'a self) -> Result<Box<dyn DbTransaction + 'a>> {
            Ok(Box::new(FakeTx { client: self }))
        }
    }

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry.register(
            Entity::new("Artist", "artist")
                .attribute(Attribute::new("id").primary_key().generated())
                .attribute(Attribute::new("name"))
                .relationship(
                    Relationship::to_many("paintings", "Painting", "artist_id", "id")
                        .delete_rule(DeleteRule::Cascade)
                        .reverse("artist"),
                ),
        );
        registry.register(
            Entity::new("Gallery", "gallery")
                .attribute(Attribute::new("id").primary_key().generated())
                .attribute(Attribute::new("city"))
                .relationship(
                    Relationship::to_many("paintings", "Painting", "gallery_id", "id")
                        .delete_rule(DeleteRule::Deny)
                        .reverse("gallery"),
                ),
        );
        registry.register(
            Entity::new("Painting", "painting")
                .attribute(Attribute::new("id").primary_key().generated())
                .attribute(Attribute::new("title"))
                .relationship(
                    Relationship::to_one("artist", "Artist", "artist_id", "id")
                        .reverse("paintings"),
                )
                .relationship(
                    Relationship::to_one("gallery", "Gallery", "gallery_id", "id")
                        .reverse("paintings"),
                ),
        );
        registry
    }

    fn domain() -> (Arc<Domain>, Arc<FakeClient>) {
        let client = Arc::new(FakeClient::default());
        let domain = Arc::new(
            Domain::builder(registry(), Arc::clone(&client) as Arc<dyn DbClient>).build(),
        );
        (domain, client)
    }

    #[test]
    fn commit_inserts_owner_before_dependent_and_replaces_temp_ids() {
        let (domain, client) = domain();
        let mut session = Session::new(&domain);

        let artist = session.create_object("Artist").unwrap();
        session
            .set_property(&artist, "name", Value::Text("Dali".into()))
            .unwrap();
        let painting = session.create_object("Painting").unwrap();
        session
            .set_property(&painting, "title", Value::Text("Clocks".into()))
            .unwrap();
        session.add_related(&artist, "paintings", &painting).unwrap();

        assert!(session.has_changes());
        session.commit_changes().unwrap();
        assert!(!session.has_changes());

        let log = client.log();
        let artist_pos = log
            .iter()
            .position(|sql| sql.contains("INSERT INTO \"artist\""))
            .expect("artist insert");
        let painting_pos = log
            .iter()
            .position(|sql| sql.contains("INSERT INTO \"painting\""))
            .expect("painting insert");
        assert!(artist_pos < painting_pos);

        let artist_id = read_object(&artist).id().clone();
        assert!(!artist_id.is_temporary());
        assert_eq!(read_object(&artist).state(), ObjectState::Committed);
        // The dependent's holder now points at the permanent identity.
        match read_object(&painting).relationship("artist") {
            Some(RelationshipHolder::ToOne(Some(id))) => assert_eq!(*id, artist_id),
            other => panic!("expected resolved to-one, got {other:?}"),
        }
    }

    #[test]
    fn rollback_detaches_new_and_restores_modified() {
        let (domain, _client) = domain();
        let mut session = Session::new(&domain);

        let artist = session.create_object("Artist").unwrap();
        session
            .set_property(&artist, "name", Value::Text("Dali".into()))
            .unwrap();
        session.commit_changes().unwrap();

        session
            .set_property(&artist, "name", Value::Text("Someone Else".into()))
            .unwrap();
        let doomed = session.create_object("Artist").unwrap();
        let doomed_id = read_object(&doomed).id().clone();

        session.rollback_changes().unwrap();

        assert_eq!(
            read_object(&artist).get("name"),
            Some(&Value::Text("Dali".into()))
        );
        assert_eq!(read_object(&artist).state(), ObjectState::Committed);
        assert_eq!(read_object(&doomed).state(), ObjectState::Transient);
        assert!(session.store().get(&doomed_id).is_none());
        assert!(!session.has_changes());
    }

    #[test]
    fn deny_rule_blocks_delete_before_sql() {
        let (domain, client) = domain();
        let mut session = Session::new(&domain);

        let gallery = session.create_object("Gallery").unwrap();
        let painting = session.create_object("Painting").unwrap();
        session
            .add_related(&gallery, "paintings", &painting)
            .unwrap();
        session.commit_changes().unwrap();
        let writes_before = client.log().len();

        let err = session.delete_object(&gallery).unwrap_err();
        match err {
            Error::DeleteDenied { relationship, .. } => assert_eq!(relationship, "paintings"),
            other => panic!("expected DeleteDenied, got {other}"),
        }
        assert_eq!(read_object(&gallery).state(), ObjectState::Committed);
        assert_eq!(client.log().len(), writes_before);
    }

    #[test]
    fn cascade_rule_deletes_related_objects() {
        let (domain, client) = domain();
        let mut session = Session::new(&domain);

        let artist = session.create_object("Artist").unwrap();
        let painting = session.create_object("Painting").unwrap();
        session.add_related(&artist, "paintings", &painting).unwrap();
        session.commit_changes().unwrap();

        session.delete_object(&artist).unwrap();
        assert_eq!(read_object(&artist).state(), ObjectState::Deleted);
        assert_eq!(read_object(&painting).state(), ObjectState::Deleted);

        session.commit_changes().unwrap();
        let log = client.log();
        let painting_pos = log
            .iter()
            .position(|sql| sql.contains("DELETE FROM \"painting\""))
            .expect("painting delete");
        let artist_pos = log
            .iter()
            .position(|sql| sql.contains("DELETE FROM \"artist\""))
            .expect("artist delete");
        assert!(painting_pos < artist_pos);
    }

    #[test]
    fn deleting_new_object_just_detaches() {
        let (domain, client) = domain();
        let mut session = Session::new(&domain);

        let artist = session.create_object("Artist").unwrap();
        let id = read_object(&artist).id().clone();
        session.delete_object(&artist).unwrap();

        assert!(session.store().get(&id).is_none());
        session.commit_changes().unwrap();
        assert!(client.log().is_empty());
    }

    #[test]
    fn validation_failure_aborts_commit() {
        let (domain, client) = domain();
        let mut session = Session::new(&domain);
        session.add_validator(Box::new(|object, failures| {
            if object.entity() == "Artist" && object.get("name").is_none() {
                failures.add(object.id().clone(), Some("name".into()), "name is required");
            }
        }));

        let artist = session.create_object("Artist").unwrap();
        let err = session.commit_changes().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(read_object(&artist).state(), ObjectState::New);
        assert!(session.has_changes());
        assert!(client.log().is_empty());

        session
            .set_property(&artist, "name", Value::Text("Dali".into()))
            .unwrap();
        session.commit_changes().unwrap();
        assert_eq!(read_object(&artist).state(), ObjectState::Committed);
    }

    #[test]
    fn committed_snapshots_reach_peers_within_drain() {
        let (domain, _client) = domain();
        let mut writer = Session::new(&domain);
        let mut reader = Session::new(&domain);

        let artist = writer.create_object("Artist").unwrap();
        writer
            .set_property(&artist, "name", Value::Text("Dali".into()))
            .unwrap();
        writer.commit_changes().unwrap();
        assert!(domain.drain_events(Duration::from_secs(5)));

        let id = read_object(&artist).id().clone();
        // Reader materializes the committed snapshot from the shared cache.
        let local = reader.local_object(None, &id);
        assert_eq!(read_object(&local).state(), ObjectState::Committed);
        assert_eq!(
            read_object(&local).get("name"),
            Some(&Value::Text("Dali".into()))
        );

        // A later peer update becomes visible after the change queue drains.
        writer
            .set_property(&artist, "name", Value::Text("Salvador Dali".into()))
            .unwrap();
        writer.commit_changes().unwrap();
        assert!(domain.drain_events(Duration::from_secs(5)));
        reader.apply_peer_changes();
        assert_eq!(
            read_object(&local).get("name"),
            Some(&Value::Text("Salvador Dali".into()))
        );
    }

    #[test]
    fn nested_commit_moves_changes_to_parent_without_sql() {
        let (domain, client) = domain();
        let mut parent = Session::new(&domain);
        let mut child = parent.nested();

        let artist = child.create_object("Artist").unwrap();
        child
            .set_property(&artist, "name", Value::Text("Dali".into()))
            .unwrap();
        child.commit_changes_to_parent(&mut parent).unwrap();

        assert!(client.log().is_empty());
        assert!(parent.has_changes());
        assert_eq!(read_object(&artist).state(), ObjectState::Committed);

        parent.commit_changes().unwrap();
        assert!(client
            .log()
            .iter()
            .any(|sql| sql.contains("INSERT INTO \"artist\"")));
    }

    #[test]
    fn local_object_reads_through_parent() {
        let (domain, _client) = domain();
        let mut parent = Session::new(&domain);
        let artist = parent.create_object("Artist").unwrap();
        parent
            .set_property(&artist, "name", Value::Text("Dali".into()))
            .unwrap();
        parent.commit_changes().unwrap();
        let id = read_object(&artist).id().clone();

        let mut child = parent.nested();
        let local = child.local_object(Some(&parent), &id);
        assert!(!Arc::ptr_eq(&local, &artist));
        assert_eq!(
            read_object(&local).get("name"),
            Some(&Value::Text("Dali".into()))
        );
        // Same identity, so asking again yields the same local instance.
        assert!(Arc::ptr_eq(&child.local_object(Some(&parent), &id), &local));
    }
}
