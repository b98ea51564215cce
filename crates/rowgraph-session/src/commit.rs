//! Commit planning and execution.
//!
//! The planner turns a session's dirty objects into row operations, orders
//! them so every foreign key it writes refers to an already-inserted row,
//! batches same-shape operations, and executes the whole plan inside one
//! transaction. Inserts follow a topological sort over entity FK
//! dependencies; circular dependencies fall back to two-phase
//! insert-then-update with the cyclic FK columns deferred. Deletes run in
//! reverse dependency order, after all updates.
//!
//! Permanent keys are produced while executing inserts and captured into an
//! id mapping before any dependent row is written.

use crate::graph_store::{ObjectGraphStore, read_object};
use crate::row_cache::CacheChange;
use rowgraph_core::{
    Cardinality, CommitError, CommitErrorKind, DbClient, DbTransaction, Entity, Error,
    KeyGenerator, ModelRegistry, ObjectId, ObjectState, RelationshipHolder, Result, Snapshot,
    Value,
};
use rowgraph_query::Dialect;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Rows inserted per multi-row INSERT statement.
const INSERT_BATCH_SIZE: usize = 100;

/// Keys per DELETE ... IN (...) statement.
const DELETE_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct InsertOp {
    pub id: ObjectId,
    pub entity: Arc<Entity>,
    /// Concrete column values, primary key excluded for generated keys.
    pub values: Vec<(String, Value)>,
    /// FK columns resolved against the id mapping at execution time.
    pub refs: Vec<(String, ObjectId)>,
    /// Cyclic FK columns written by a post-insert UPDATE.
    pub deferred: Vec<(String, ObjectId)>,
}

#[derive(Debug, Clone)]
pub struct UpdateOp {
    pub id: ObjectId,
    pub entity: Arc<Entity>,
    pub values: Vec<(String, Value)>,
    pub refs: Vec<(String, ObjectId)>,
}

#[derive(Debug, Clone)]
pub struct DeleteOp {
    pub id: ObjectId,
    pub entity: Arc<Entity>,
}

/// Ordered row operations for one commit attempt.
#[derive(Debug, Clone, Default)]
pub struct CommitPlan {
    pub inserts: Vec<InsertOp>,
    pub updates: Vec<UpdateOp>,
    pub deletes: Vec<DeleteOp>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// What a successful commit produced: the temporary-to-permanent id mapping
/// and the change set to merge into caches.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub id_mapping: Vec<(ObjectId, ObjectId)>,
    pub change: CacheChange,
}

/// Plans and executes commits for one mapping registry and dialect.
pub struct CommitPlanner<'a> {
    registry: &'a ModelRegistry,
    dialect: Dialect,
}

impl<'a> CommitPlanner<'a> {
    pub fn new(registry: &'a ModelRegistry, dialect: Dialect) -> Self {
        Self { registry, dialect }
    }

    /// Build the ordered row-operation plan from a session's dirty objects.
    pub fn plan(&self, store: &ObjectGraphStore) -> Result<CommitPlan> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for handle in store.dirty_objects() {
            let object = read_object(&handle);
            let entity = self.registry.require(object.entity())?;
            match object.state() {
                ObjectState::New => {
                    let (values, refs) = self.row_values(&entity, &object, true);
                    inserts.push(InsertOp {
                        id: object.id().clone(),
                        entity,
                        values,
                        refs,
                        deferred: Vec::new(),
                    });
                }
                ObjectState::Modified => {
                    let (values, refs) = self.row_values(&entity, &object, false);
                    let baseline = store.baseline(object.id());
                    let (values, refs) = changed_only(values, refs, &entity, baseline);
                    if !values.is_empty() || !refs.is_empty() {
                        updates.push(UpdateOp {
                            id: object.id().clone(),
                            entity,
                            values,
                            refs,
                        });
                    }
                }
                ObjectState::Deleted => {
                    deletes.push(DeleteOp {
                        id: object.id().clone(),
                        entity,
                    });
                }
                _ => {}
            }
        }

        self.order_inserts(&mut inserts);
        self.order_deletes(&mut deletes);

        Ok(CommitPlan {
            inserts,
            updates,
            deletes,
        })
    }

    /// Execute a plan inside one transaction and capture generated keys.
    pub fn execute(
        &self,
        plan: CommitPlan,
        client: &dyn DbClient,
        keys: &dyn KeyGenerator,
    ) -> Result<CommitOutcome> {
        let mut tx = client.begin().map_err(|e| {
            Error::Commit(CommitError {
                kind: CommitErrorKind::Transaction,
                sql: None,
                message: format!("failed to open commit transaction: {e}"),
                source: None,
            })
        })?;

        match self.run(&mut tx, plan, keys) {
            Ok(outcome) => {
                tx.commit().map_err(|e| {
                    Error::Commit(CommitError {
                        kind: CommitErrorKind::Transaction,
                        sql: None,
                        message: format!("commit failed: {e}"),
                        source: None,
                    })
                })?;
                Ok(outcome)
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    fn run(
        &self,
        tx: &mut Box<dyn DbTransaction + '_>,
        plan: CommitPlan,
        keys: &dyn KeyGenerator,
    ) -> Result<CommitOutcome> {
        let mut mapping: HashMap<ObjectId, ObjectId> = HashMap::new();
        let mut outcome = CommitOutcome::default();
        let mut deferred_updates: Vec<(ObjectId, Arc<Entity>, Vec<(String, ObjectId)>)> =
            Vec::new();

        debug!(
            target: "rowgraph::commit",
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            "executing commit plan"
        );

        // Inserts, batched per entity and column shape.
        let mut batch_rows: Vec<Vec<Value>> = Vec::new();
        let mut batch_shape: Option<(String, Vec<String>)> = None;
        for op in plan.inserts {
            let final_id = self.permanent_id(&op, keys, &mut mapping)?;

            let mut row: Vec<(String, Value)> = op.values.clone();
            for (column, value) in final_id.key_pairs() {
                if !row.iter().any(|(c, _)| c == column) {
                    row.push((column.clone(), value.clone()));
                }
            }
            for (column, target) in &op.refs {
                row.push((column.clone(), resolve_ref(target, column, &op.entity, &mapping)?));
            }
            for (column, _) in &op.deferred {
                row.push((column.clone(), Value::Null));
            }
            row.sort_by(|a, b| a.0.cmp(&b.0));

            if !op.deferred.is_empty() {
                deferred_updates.push((final_id.clone(), Arc::clone(&op.entity), op.deferred.clone()));
            }

            let columns: Vec<String> = row.iter().map(|(c, _)| c.clone()).collect();
            let shape = (op.entity.table.clone(), columns);
            let values: Vec<Value> = row.iter().map(|(_, v)| v.clone()).collect();

            let flush = match &batch_shape {
                Some(current) => current != &shape || batch_rows.len() >= INSERT_BATCH_SIZE,
                None => false,
            };
            if flush {
                let (table, columns) = batch_shape.take().unwrap_or_default();
                self.flush_insert_batch(tx, &table, &columns, std::mem::take(&mut batch_rows))?;
            }
            if batch_shape.is_none() {
                batch_shape = Some(shape);
            }
            batch_rows.push(values);

            outcome
                .change
                .added
                .push((final_id, Snapshot::from_pairs(row)));
        }
        if let Some((table, columns)) = batch_shape.take() {
            self.flush_insert_batch(tx, &table, &columns, batch_rows)?;
        }

        // Two-phase FK columns for circular dependencies.
        for (id, entity, refs) in deferred_updates {
            let mut values = Vec::new();
            for (column, target) in &refs {
                values.push((column.clone(), resolve_ref(target, column, &entity, &mapping)?));
            }
            self.execute_update(tx, &entity, &id, &values)?;
            merge_update(&mut outcome.change, &id, values);
        }

        // Updates, after every insert they might reference.
        for op in plan.updates {
            let mut values = op.values.clone();
            for (column, target) in &op.refs {
                values.push((column.clone(), resolve_ref(target, column, &op.entity, &mapping)?));
            }
            self.execute_update(tx, &op.entity, &op.id, &values)?;
            merge_update(&mut outcome.change, &op.id, values);
        }

        // Deletes, in reverse dependency order.
        let mut i = 0;
        let deletes = plan.deletes;
        while i < deletes.len() {
            let entity = Arc::clone(&deletes[i].entity);
            let mut j = i;
            while j < deletes.len() && deletes[j].entity.name == entity.name {
                j += 1;
            }
            self.execute_deletes(tx, &entity, &deletes[i..j])?;
            for op in &deletes[i..j] {
                outcome.change.deleted.push(op.id.clone());
            }
            i = j;
        }

        outcome.id_mapping = mapping.into_iter().collect();
        Ok(outcome)
    }

    /// Assign a permanent identity for an insert, recording the mapping.
    fn permanent_id(
        &self,
        op: &InsertOp,
        keys: &dyn KeyGenerator,
        mapping: &mut HashMap<ObjectId, ObjectId>,
    ) -> Result<ObjectId> {
        if !op.id.is_temporary() {
            return Ok(op.id.clone());
        }
        let permanent = if let Some(pk) = op.entity.generated_pk() {
            let key = keys.next_key(&op.entity)?;
            op.id.with_permanent_key([(pk.column.clone(), key)])
        } else {
            // User-assigned keys must be present among the written values.
            let mut pairs = Vec::new();
            for column in op.entity.pk_columns() {
                let value = op
                    .values
                    .iter()
                    .find(|(c, _)| c == column)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| {
                        Error::Commit(CommitError {
                            kind: CommitErrorKind::KeyGeneration,
                            sql: None,
                            message: format!(
                                "no value for primary key column '{column}' of new {}",
                                op.id
                            ),
                            source: None,
                        })
                    })?;
                pairs.push((column.to_string(), value));
            }
            op.id.with_permanent_key(pairs)
        };
        mapping.insert(op.id.clone(), permanent.clone());
        Ok(permanent)
    }

    /// Column values and FK references for one object's row.
    ///
    /// For inserts every non-key column is written (unset attributes as
    /// NULL); for updates only set attributes are considered, and the
    /// changed-column filter is applied afterwards.
    fn row_values(
        &self,
        entity: &Entity,
        object: &rowgraph_core::DomainObject,
        include_unset: bool,
    ) -> (Vec<(String, Value)>, Vec<(String, ObjectId)>) {
        let mut refs: Vec<(String, ObjectId)> = Vec::new();
        let mut null_fks: HashSet<String> = HashSet::new();

        for relationship in &entity.relationships {
            if relationship.cardinality != Cardinality::ToOne {
                continue;
            }
            match object.relationship(&relationship.name) {
                Some(RelationshipHolder::ToOne(Some(target))) => {
                    refs.push((relationship.fk_column.clone(), target.clone()));
                }
                Some(RelationshipHolder::ToOne(None)) => {
                    null_fks.insert(relationship.fk_column.clone());
                }
                _ => {}
            }
        }

        let mut values = Vec::new();
        for attribute in &entity.attributes {
            if attribute.primary_key {
                continue;
            }
            if refs.iter().any(|(c, _)| c == &attribute.column) {
                continue;
            }
            match object.get(&attribute.name) {
                Some(value) => values.push((attribute.column.clone(), value.clone())),
                None if null_fks.contains(&attribute.column) || include_unset => {
                    values.push((attribute.column.clone(), Value::Null));
                }
                None => {}
            }
        }
        for column in null_fks {
            if !values.iter().any(|(c, _)| c == &column) {
                values.push((column, Value::Null));
            }
        }

        (values, refs)
    }

    /// Topologically sort inserts so FK targets come first; entities caught
    /// in a dependency cycle insert last with their cyclic FKs deferred.
    fn order_inserts(&self, inserts: &mut Vec<InsertOp>) {
        let entities: HashSet<String> = inserts.iter().map(|op| op.entity.name.clone()).collect();
        let (levels, residue) = dependency_levels(self.registry, &entities);

        for op in inserts.iter_mut() {
            if residue.contains(&op.entity.name) {
                let (kept, deferred): (Vec<_>, Vec<_>) =
                    op.refs.drain(..).partition(|(column, _)| {
                        let target_entity = op
                            .entity
                            .relationships
                            .iter()
                            .find(|r| &r.fk_column == column)
                            .map(|r| r.target.as_str());
                        target_entity.is_none_or(|t| !residue.contains(t))
                    });
                op.refs = kept;
                op.deferred = deferred;
            }
        }

        inserts.sort_by(|a, b| {
            let la = levels.get(&a.entity.name).copied().unwrap_or(usize::MAX);
            let lb = levels.get(&b.entity.name).copied().unwrap_or(usize::MAX);
            la.cmp(&lb).then_with(|| a.entity.name.cmp(&b.entity.name))
        });
    }

    /// Order deletes so FK-holding rows go before the rows they reference.
    fn order_deletes(&self, deletes: &mut [DeleteOp]) {
        let entities: HashSet<String> = deletes.iter().map(|op| op.entity.name.clone()).collect();
        let (levels, _) = dependency_levels(self.registry, &entities);
        deletes.sort_by(|a, b| {
            let la = levels.get(&a.entity.name).copied().unwrap_or(usize::MAX);
            let lb = levels.get(&b.entity.name).copied().unwrap_or(usize::MAX);
            lb.cmp(&la).then_with(|| a.entity.name.cmp(&b.entity.name))
        });
    }

    fn flush_insert_batch(
        &self,
        tx: &mut Box<dyn DbTransaction + '_>,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let quoted: Vec<String> = columns
            .iter()
            .map(|c| self.dialect.quote_identifier(c))
            .collect();
        let mut params = Vec::new();
        let mut tuples = Vec::new();
        for row in rows {
            let placeholders: Vec<String> = row
                .into_iter()
                .map(|value| {
                    params.push(value);
                    self.dialect.placeholder(params.len())
                })
                .collect();
            tuples.push(format!("({})", placeholders.join(", ")));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.dialect.quote_identifier(table),
            quoted.join(", "),
            tuples.join(", "),
        );
        self.execute_write(tx, &sql, &params)
    }

    fn execute_update(
        &self,
        tx: &mut Box<dyn DbTransaction + '_>,
        entity: &Entity,
        id: &ObjectId,
        values: &[(String, Value)],
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut params = Vec::new();
        let sets: Vec<String> = values
            .iter()
            .map(|(column, value)| {
                params.push(value.clone());
                format!(
                    "{} = {}",
                    self.dialect.quote_identifier(column),
                    self.dialect.placeholder(params.len())
                )
            })
            .collect();
        let conditions: Vec<String> = id
            .key_pairs()
            .iter()
            .map(|(column, value)| {
                params.push(value.clone());
                format!(
                    "{} = {}",
                    self.dialect.quote_identifier(column),
                    self.dialect.placeholder(params.len())
                )
            })
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.dialect.quote_identifier(&entity.table),
            sets.join(", "),
            conditions.join(" AND "),
        );
        self.execute_write(tx, &sql, &params)
    }

    fn execute_deletes(
        &self,
        tx: &mut Box<dyn DbTransaction + '_>,
        entity: &Entity,
        ops: &[DeleteOp],
    ) -> Result<()> {
        let pk_columns = entity.pk_columns();
        if pk_columns.len() == 1 {
            let column = pk_columns[0];
            for chunk in ops.chunks(DELETE_BATCH_SIZE) {
                let mut params = Vec::new();
                let placeholders: Vec<String> = chunk
                    .iter()
                    .filter_map(|op| op.id.key_value(column).cloned())
                    .map(|value| {
                        params.push(value);
                        self.dialect.placeholder(params.len())
                    })
                    .collect();
                let sql = format!(
                    "DELETE FROM {} WHERE {} IN ({})",
                    self.dialect.quote_identifier(&entity.table),
                    self.dialect.quote_identifier(column),
                    placeholders.join(", "),
                );
                self.execute_write(tx, &sql, &params)?;
            }
        } else {
            // Compound keys share one statement shape; run it as a batch of
            // parameter sets.
            let Some(first) = ops.first() else {
                return Ok(());
            };
            let conditions: Vec<String> = first
                .id
                .key_pairs()
                .iter()
                .enumerate()
                .map(|(i, (column, _))| {
                    format!(
                        "{} = {}",
                        self.dialect.quote_identifier(column),
                        self.dialect.placeholder(i + 1)
                    )
                })
                .collect();
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                self.dialect.quote_identifier(&entity.table),
                conditions.join(" AND "),
            );
            let param_sets: Vec<Vec<Value>> = ops
                .iter()
                .map(|op| op.id.key_pairs().iter().map(|(_, v)| v.clone()).collect())
                .collect();
            tx.execute_batch(&sql, &param_sets)
                .map_err(|e| write_error(&sql, &e))?;
        }
        Ok(())
    }

    fn execute_write(
        &self,
        tx: &mut Box<dyn DbTransaction + '_>,
        sql: &str,
        params: &[Value],
    ) -> Result<()> {
        tx.execute(sql, params)
            .map_err(|e| write_error(sql, &e))?;
        Ok(())
    }
}

/// Classify a client failure as a commit error, keeping the statement for
/// diagnostics.
fn write_error(sql: &str, e: &Error) -> Error {
    let message = e.to_string();
    let lowered = message.to_lowercase();
    let kind = if lowered.contains("constraint")
        || lowered.contains("unique")
        || lowered.contains("foreign key")
    {
        CommitErrorKind::Constraint
    } else {
        CommitErrorKind::Database
    };
    Error::Commit(CommitError {
        kind,
        sql: Some(sql.to_string()),
        message,
        source: None,
    })
}

/// Resolve an FK reference to the concrete key value of its target row.
fn resolve_ref(
    target: &ObjectId,
    column: &str,
    entity: &Entity,
    mapping: &HashMap<ObjectId, ObjectId>,
) -> Result<Value> {
    let effective = if target.is_temporary() {
        mapping.get(target).ok_or_else(|| {
            Error::Commit(CommitError {
                kind: CommitErrorKind::KeyGeneration,
                sql: None,
                message: format!("FK column '{column}' references unsaved object {target}"),
                source: None,
            })
        })?
    } else {
        target
    };
    let joined_pk = entity
        .relationships
        .iter()
        .find(|r| r.fk_column == column)
        .map_or("id", |r| r.joined_pk_column.as_str());
    effective
        .key_value(joined_pk)
        .or_else(|| effective.single_key_value())
        .cloned()
        .ok_or_else(|| {
            Error::Commit(CommitError {
                kind: CommitErrorKind::KeyGeneration,
                sql: None,
                message: format!("target {effective} has no key value for column '{joined_pk}'"),
                source: None,
            })
        })
}

fn merge_update(change: &mut CacheChange, id: &ObjectId, values: Vec<(String, Value)>) {
    if let Some((_, snapshot)) = change.updated.iter_mut().find(|(i, _)| i == id) {
        snapshot.merge(&Snapshot::from_pairs(values));
    } else if let Some((_, snapshot)) = change.added.iter_mut().find(|(i, _)| i == id) {
        snapshot.merge(&Snapshot::from_pairs(values));
    } else {
        change.updated.push((id.clone(), Snapshot::from_pairs(values)));
    }
}

/// Keep only columns whose value differs from the baseline snapshot; an FK
/// reference to an unsaved target always counts as changed. Reference
/// comparison must read the same key component `resolve_ref` will write:
/// the joined PK column of the relationship owning the FK.
fn changed_only(
    values: Vec<(String, Value)>,
    refs: Vec<(String, ObjectId)>,
    entity: &Entity,
    baseline: Option<&Snapshot>,
) -> (Vec<(String, Value)>, Vec<(String, ObjectId)>) {
    let Some(baseline) = baseline else {
        return (values, refs);
    };
    let values = values
        .into_iter()
        .filter(|(column, value)| baseline.get(column) != Some(value))
        .collect();
    let refs = refs
        .into_iter()
        .filter(|(column, target)| {
            if target.is_temporary() {
                return true;
            }
            let joined_pk = entity
                .relationships
                .iter()
                .find(|r| r.fk_column == *column)
                .map_or("id", |r| r.joined_pk_column.as_str());
            let current = target
                .key_value(joined_pk)
                .or_else(|| target.single_key_value());
            baseline.get(column) != current
        })
        .collect();
    (values, refs)
}

/// Kahn's algorithm over entity FK dependencies, scoped to the entities
/// actually present in the plan. Returns per-entity levels (targets before
/// dependents) and the residue of entities stuck in cycles.
fn dependency_levels(
    registry: &ModelRegistry,
    entities: &HashSet<String>,
) -> (HashMap<String, usize>, HashSet<String>) {
    // deps[X] = entities X references via a to-one FK.
    let mut deps: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for name in entities {
        deps.entry(name.as_str()).or_default();
    }
    for name in entities {
        let Some(entity) = registry.get(name) else {
            continue;
        };
        for relationship in &entity.relationships {
            if relationship.cardinality == Cardinality::ToOne
                && entities.contains(&relationship.target)
                && relationship.target != *name
            {
                let target = entities.get(&relationship.target).map(String::as_str);
                let owner = entities.get(name).map(String::as_str);
                if let (Some(target), Some(owner)) = (target, owner) {
                    if deps.entry(owner).or_default().insert(target) {
                        dependents.entry(target).or_default().push(owner);
                    }
                }
            } else if relationship.cardinality == Cardinality::ToOne
                && relationship.target == *name
            {
                // Self-reference: unconditionally cyclic.
                if let Some(owner) = entities.get(name).map(String::as_str) {
                    deps.entry(owner).or_default().insert(owner);
                }
            }
        }
    }

    let mut levels: HashMap<String, usize> = HashMap::new();
    let mut counts: HashMap<&str, usize> = deps
        .iter()
        .map(|(name, targets)| (*name, targets.len()))
        .collect();
    let mut queue: VecDeque<(&str, usize)> = counts
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| (*name, 0))
        .collect();

    while let Some((name, level)) = queue.pop_front() {
        levels.insert(name.to_string(), level);
        for dependent in dependents.get(name).cloned().unwrap_or_default() {
            let count = counts.entry(dependent).or_default();
            *count = count.saturating_sub(1);
            if *count == 0 {
                queue.push_back((dependent, level + 1));
            }
        }
    }

    let max_level = levels.values().copied().max().unwrap_or(0);
    let residue: HashSet<String> = entities
        .iter()
        .filter(|name| !levels.contains_key(*name))
        .cloned()
        .collect();
    for name in &residue {
        levels.insert(name.clone(), max_level + 1);
    }
    (levels, residue)
}
