//! Query-to-SQL translation.
//!
//! Translation turns one [`ObjectQuery`] into a primary SELECT plus a plan
//! for secondary SELECTs, one per disjoint prefetch path. Joint prefetch
//! paths contribute LEFT-JOINed column blocks to the primary statement
//! instead. Every selected column is labeled `alias__column` so the
//! resolver can slice wide rows back into per-entity snapshots by prefix.
//!
//! Path joins are registered once per relationship path and reused: a
//! qualifier, an ordering, and a joint prefetch that all traverse the same
//! to-one path share one join instance and one alias.

use crate::expr::{Dialect, PathResolver};
use crate::prefetch::{PrefetchSemantics, PrefetchTree};
use crate::query::{AttributeFaultQuery, ObjectQuery, SqlStatement};
use rowgraph_core::{Entity, Error, ModelRegistry, Relationship, Result, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// Alias of the root (or secondary-target) entity in generated SQL.
pub const ROOT_ALIAS: &str = "t0";

/// Separator between a table alias and a column name in result labels.
pub const LABEL_SEPARATOR: &str = "__";

/// One block of columns in the primary result: the root entity or a joint
/// prefetch target.
#[derive(Debug, Clone)]
pub struct ResultSegment {
    /// Dotted prefetch path; empty for the root segment.
    pub path: String,
    /// Table alias whose `alias__column` labels carry this segment.
    pub alias: String,
    /// Entity the segment's rows belong to.
    pub entity: Arc<Entity>,
    /// Relationship from the parent segment; `None` for the root.
    pub relationship: Option<Relationship>,
}

impl ResultSegment {
    /// Dotted path of the parent segment ("" for children of the root).
    pub fn parent_path(&self) -> &str {
        match self.path.rsplit_once('.') {
            Some((parent, _)) => parent,
            None => "",
        }
    }
}

/// Plan for one disjoint prefetch path.
#[derive(Debug, Clone)]
pub enum SecondaryFetch {
    /// Separate SELECT carrying the owner query's qualifier, translated at
    /// query time.
    Disjoint {
        path: String,
        relationship: Relationship,
        entity: Arc<Entity>,
        statement: SqlStatement,
        /// Result label whose value links a child row to its owner.
        link_label: String,
    },
    /// Separate SELECT filtered by fetched owner keys, built at execution
    /// time via [`QueryTranslator::by_id_statement`].
    ById {
        path: String,
        relationship: Relationship,
        entity: Arc<Entity>,
        link_label: String,
    },
}

impl SecondaryFetch {
    /// Dotted prefetch path.
    pub fn path(&self) -> &str {
        match self {
            SecondaryFetch::Disjoint { path, .. } | SecondaryFetch::ById { path, .. } => path,
        }
    }
}

/// A translated query: primary statement, its result layout, and the
/// secondary fetch plan.
#[derive(Debug, Clone)]
pub struct SelectTranslation {
    pub statement: SqlStatement,
    /// Root segment first, then joint prefetch segments parents-first.
    pub segments: Vec<ResultSegment>,
    pub secondaries: Vec<SecondaryFetch>,
}

/// Compiles object queries into SQL for one mapping registry and dialect.
pub struct QueryTranslator<'a> {
    registry: &'a ModelRegistry,
    dialect: Dialect,
}

impl<'a> QueryTranslator<'a> {
    pub fn new(registry: &'a ModelRegistry, dialect: Dialect) -> Self {
        Self { registry, dialect }
    }

    /// Translate a query into its primary statement and secondary plan.
    pub fn translate(&self, query: &ObjectQuery) -> Result<SelectTranslation> {
        let root = self.registry.require(&query.entity)?;

        let mut prefetch = query.prefetch.clone();
        prefetch.resolve_undefined(PrefetchSemantics::Disjoint);
        // A row limit narrows the owner set after the fact, so qualifier-
        // scoped secondaries would overfetch; key-scoped ones stay exact.
        if query.limit.is_some() || query.offset.is_some() {
            demote_disjoint(&mut prefetch);
        }

        let mut builder = SelectBuilder::new(self.registry, self.dialect, Arc::clone(&root));
        let mut segments = vec![ResultSegment {
            path: String::new(),
            alias: ROOT_ALIAS.to_string(),
            entity: Arc::clone(&root),
            relationship: None,
        }];
        let mut secondaries = Vec::new();

        for (path, node) in prefetch.walk() {
            let segments_of_path: Vec<&str> = path.split('.').collect();
            let (_, owner_entity) = builder.entity_at(&segments_of_path[..segments_of_path.len() - 1])?;
            let name = segments_of_path[segments_of_path.len() - 1];
            let relationship = owner_entity
                .relationship_named(name)
                .ok_or_else(|| {
                    Error::translation(format!(
                        "no relationship '{name}' on entity '{}'",
                        owner_entity.name
                    ))
                })?
                .clone();
            let target = self.registry.require(&relationship.target)?;

            match node.semantics {
                PrefetchSemantics::Joint => {
                    if relationship.is_to_many()
                        && (query.limit.is_some() || query.offset.is_some())
                    {
                        return Err(Error::translation(format!(
                            "joint prefetch of to-many '{path}' cannot be combined with limit/offset"
                        )));
                    }
                    if parent_is_disjoint(&prefetch, &path) {
                        return Err(Error::translation(format!(
                            "joint prefetch '{path}' cannot be nested under a disjoint path"
                        )));
                    }
                    let (alias, entity) = builder.join_path(&segments_of_path)?;
                    segments.push(ResultSegment {
                        path: path.clone(),
                        alias,
                        entity,
                        relationship: Some(relationship),
                    });
                }
                PrefetchSemantics::Disjoint => {
                    let statement = self.translate_secondary(query, &segments_of_path)?;
                    let link_label = link_label(&relationship);
                    secondaries.push(SecondaryFetch::Disjoint {
                        path: path.clone(),
                        relationship,
                        entity: target,
                        statement,
                        link_label,
                    });
                }
                PrefetchSemantics::DisjointById => {
                    let link_label = link_label(&relationship);
                    secondaries.push(SecondaryFetch::ById {
                        path: path.clone(),
                        relationship,
                        entity: target,
                        link_label,
                    });
                }
                PrefetchSemantics::Undefined => unreachable!("resolved above"),
            }
        }

        let mut params = Vec::new();
        let where_sql = match &query.qualifier {
            Some(q) => Some(q.build(self.dialect, &mut builder, &mut params, 0)?),
            None => None,
        };
        let mut order_terms = Vec::new();
        for ordering in &query.orderings {
            order_terms.push(ordering.build(self.dialect, &mut builder)?);
        }

        let mut select_list = Vec::new();
        for segment in &segments {
            for column in segment.entity.fetched_columns() {
                select_list.push(self.labeled_column(&segment.alias, column));
            }
        }

        let mut sql = String::from("SELECT ");
        if builder.crossed_to_many {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&select_list.join(", "));
        let _ = write!(
            sql,
            " FROM {} {}",
            self.dialect.quote_identifier(&root.table),
            self.dialect.quote_identifier(ROOT_ALIAS)
        );
        for join in &builder.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if let Some(where_sql) = where_sql {
            let _ = write!(sql, " WHERE {where_sql}");
        }
        if !order_terms.is_empty() {
            let _ = write!(sql, " ORDER BY {}", order_terms.join(", "));
        }
        if let Some(limit) = query.limit {
            let _ = write!(sql, " LIMIT {limit}");
        }
        if let Some(offset) = query.offset {
            let _ = write!(sql, " OFFSET {offset}");
        }

        debug!(
            target: "rowgraph::translate",
            entity = %query.entity,
            segments = segments.len(),
            secondaries = secondaries.len(),
            "translated query"
        );
        Ok(SelectTranslation {
            statement: SqlStatement { sql, params },
            segments,
            secondaries,
        })
    }

    /// Secondary SELECT for a disjoint path: the target entity's columns,
    /// joined back to the root table along the reverse of the path and
    /// narrowed by the owner query's qualifier. Qualifier paths get fresh
    /// join instances so filtering narrows owners, never the related set.
    fn translate_secondary(&self, query: &ObjectQuery, path: &[&str]) -> Result<SqlStatement> {
        let root = self.registry.require(&query.entity)?;

        // Walk the path, collecting (owner entity, relationship, target).
        let mut chain: Vec<(Arc<Entity>, Relationship)> = Vec::new();
        let mut current = Arc::clone(&root);
        for segment in path {
            let relationship = current
                .relationship_named(segment)
                .ok_or_else(|| {
                    Error::translation(format!(
                        "no relationship '{segment}' on entity '{}'",
                        current.name
                    ))
                })?
                .clone();
            let target = self.registry.require(&relationship.target)?;
            chain.push((Arc::clone(&current), relationship));
            current = target;
        }
        let target = current;

        // Aliases run from the target ("t0") back to the root.
        let alias_of = |depth_from_target: usize| {
            if depth_from_target == 0 {
                ROOT_ALIAS.to_string()
            } else {
                format!("c{depth_from_target}")
            }
        };
        let root_alias = alias_of(chain.len());

        let mut sql = String::from("SELECT ");
        let mut select_list: Vec<String> = target
            .fetched_columns()
            .iter()
            .map(|c| self.labeled_column(ROOT_ALIAS, c))
            .collect();
        let (_, last_rel) = &chain[chain.len() - 1];
        let link = link_column(last_rel);
        if !target.fetched_columns().contains(&link) {
            select_list.push(self.labeled_column(ROOT_ALIAS, link));
        }
        sql.push_str(&select_list.join(", "));
        let _ = write!(
            sql,
            " FROM {} {}",
            self.dialect.quote_identifier(&target.table),
            self.dialect.quote_identifier(ROOT_ALIAS)
        );

        // Reverse joins: target -> ... -> root.
        for (i, (owner, relationship)) in chain.iter().enumerate().rev() {
            let owner_alias = alias_of(chain.len() - i);
            let child_alias = alias_of(chain.len() - i - 1);
            let (owner_col, child_col) = if relationship.is_to_many() {
                (
                    relationship.joined_pk_column.as_str(),
                    relationship.fk_column.as_str(),
                )
            } else {
                (
                    relationship.fk_column.as_str(),
                    relationship.joined_pk_column.as_str(),
                )
            };
            let _ = write!(
                sql,
                " JOIN {} {} ON {}.{} = {}.{}",
                self.dialect.quote_identifier(&owner.table),
                self.dialect.quote_identifier(&owner_alias),
                self.dialect.quote_identifier(&owner_alias),
                self.dialect.quote_identifier(owner_col),
                self.dialect.quote_identifier(&child_alias),
                self.dialect.quote_identifier(child_col),
            );
        }

        let mut params = Vec::new();
        if let Some(qualifier) = &query.qualifier {
            let mut builder = SelectBuilder::with_alias(
                self.registry,
                self.dialect,
                Arc::clone(&root),
                root_alias,
                "q",
            );
            let where_sql = qualifier.build(self.dialect, &mut builder, &mut params, 0)?;
            for join in &builder.joins {
                sql.push(' ');
                sql.push_str(join);
            }
            let _ = write!(sql, " WHERE {where_sql}");
        }

        Ok(SqlStatement { sql, params })
    }

    /// SELECT for a disjoint-by-id path, filtered by the fetched owner keys.
    pub fn by_id_statement(
        &self,
        relationship: &Relationship,
        owner_keys: &[Value],
    ) -> Result<SqlStatement> {
        let target = self.registry.require(&relationship.target)?;
        let link = link_column(relationship);

        let mut select_list: Vec<String> = target
            .fetched_columns()
            .iter()
            .map(|c| self.labeled_column(ROOT_ALIAS, c))
            .collect();
        if !target.fetched_columns().contains(&link) {
            select_list.push(self.labeled_column(ROOT_ALIAS, link));
        }

        let mut params = Vec::new();
        let placeholders: Vec<String> = owner_keys
            .iter()
            .map(|key| {
                params.push(key.clone());
                self.dialect.placeholder(params.len())
            })
            .collect();

        let sql = format!(
            "SELECT {} FROM {} {} WHERE {}.{} IN ({})",
            select_list.join(", "),
            self.dialect.quote_identifier(&target.table),
            self.dialect.quote_identifier(ROOT_ALIAS),
            self.dialect.quote_identifier(ROOT_ALIAS),
            self.dialect.quote_identifier(link),
            placeholders.join(", "),
        );
        Ok(SqlStatement { sql, params })
    }

    /// Single-row SELECT resolving one lazy attribute fault.
    pub fn attribute_fault_statement(&self, fault: &AttributeFaultQuery) -> Result<SqlStatement> {
        let entity = self.registry.require(fault.id.entity())?;
        if fault.id.is_temporary() {
            return Err(Error::translation(format!(
                "cannot fetch column '{}' for unsaved object {}",
                fault.column, fault.id
            )));
        }
        let mut params = Vec::new();
        let mut conditions = Vec::new();
        for (column, value) in fault.id.key_pairs() {
            params.push(value.clone());
            conditions.push(format!(
                "{} = {}",
                self.dialect.quote_identifier(column),
                self.dialect.placeholder(params.len())
            ));
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            self.dialect.quote_identifier(&fault.column),
            self.dialect.quote_identifier(&entity.table),
            conditions.join(" AND "),
        );
        Ok(SqlStatement { sql, params })
    }

    fn labeled_column(&self, alias: &str, column: &str) -> String {
        format!(
            "{}.{} AS {}",
            self.dialect.quote_identifier(alias),
            self.dialect.quote_identifier(column),
            self.dialect
                .quote_identifier(&format!("{alias}{LABEL_SEPARATOR}{column}")),
        )
    }
}

/// Result label carrying the owner-linking value of a secondary row.
fn link_label(relationship: &Relationship) -> String {
    format!("{ROOT_ALIAS}{LABEL_SEPARATOR}{}", link_column(relationship))
}

/// Column on the secondary target that links each child row to its owner:
/// the FK for to-many, the joined PK for to-one.
fn link_column(relationship: &Relationship) -> &str {
    if relationship.is_to_many() {
        &relationship.fk_column
    } else {
        &relationship.joined_pk_column
    }
}

fn demote_disjoint(tree: &mut PrefetchTree) {
    let paths: Vec<String> = tree
        .walk()
        .into_iter()
        .filter(|(_, node)| node.semantics == PrefetchSemantics::Disjoint)
        .map(|(path, _)| path)
        .collect();
    for path in paths {
        tree.add(&path, PrefetchSemantics::DisjointById);
    }
}

fn parent_is_disjoint(tree: &PrefetchTree, path: &str) -> bool {
    let mut prefix = String::new();
    for segment in path.split('.') {
        if !prefix.is_empty() {
            if let Some(node) = tree.node(&prefix) {
                if node.semantics != PrefetchSemantics::Joint {
                    return true;
                }
            }
        }
        if !prefix.is_empty() {
            prefix.push('.');
        }
        prefix.push_str(segment);
    }
    false
}

/// Accumulates joins and aliases while a statement renders. Implements
/// [`PathResolver`] so qualifier and ordering paths register their joins as
/// they resolve.
struct SelectBuilder<'a> {
    registry: &'a ModelRegistry,
    dialect: Dialect,
    root: Arc<Entity>,
    root_alias: String,
    alias_prefix: &'static str,
    next_alias: usize,
    alias_by_path: HashMap<String, (String, Arc<Entity>)>,
    joins: Vec<String>,
    crossed_to_many: bool,
}

impl<'a> SelectBuilder<'a> {
    fn new(registry: &'a ModelRegistry, dialect: Dialect, root: Arc<Entity>) -> Self {
        Self::with_alias(registry, dialect, root, ROOT_ALIAS.to_string(), "t")
    }

    fn with_alias(
        registry: &'a ModelRegistry,
        dialect: Dialect,
        root: Arc<Entity>,
        root_alias: String,
        alias_prefix: &'static str,
    ) -> Self {
        Self {
            registry,
            dialect,
            root,
            root_alias,
            alias_prefix,
            next_alias: 1,
            alias_by_path: HashMap::new(),
            joins: Vec::new(),
            crossed_to_many: false,
        }
    }

    /// Alias and entity at the end of a relationship-path prefix, without
    /// adding joins. Empty path means the root.
    fn entity_at(&self, segments: &[&str]) -> Result<(String, Arc<Entity>)> {
        if segments.is_empty() {
            return Ok((self.root_alias.clone(), Arc::clone(&self.root)));
        }
        let key = segments.join(".");
        match self.alias_by_path.get(&key) {
            Some((alias, entity)) => Ok((alias.clone(), Arc::clone(entity))),
            None => {
                // Walk metadata only; callers join parents before children.
                let mut entity = Arc::clone(&self.root);
                for segment in segments {
                    let relationship = entity.relationship_named(segment).ok_or_else(|| {
                        Error::translation(format!(
                            "no relationship '{segment}' on entity '{}'",
                            entity.name
                        ))
                    })?;
                    entity = self.registry.require(&relationship.target)?;
                }
                Ok((String::new(), entity))
            }
        }
    }

    /// Register LEFT JOINs down a relationship path, reusing any joins an
    /// earlier path already added. Returns the terminal alias and entity.
    fn join_path(&mut self, segments: &[&str]) -> Result<(String, Arc<Entity>)> {
        let mut alias = self.root_alias.clone();
        let mut entity = Arc::clone(&self.root);
        let mut key = String::new();
        for segment in segments {
            if !key.is_empty() {
                key.push('.');
            }
            key.push_str(segment);
            if let Some((existing_alias, existing_entity)) = self.alias_by_path.get(&key) {
                alias = existing_alias.clone();
                entity = Arc::clone(existing_entity);
                continue;
            }
            let relationship = entity
                .relationship_named(segment)
                .ok_or_else(|| {
                    Error::translation(format!(
                        "no relationship '{segment}' on entity '{}'",
                        entity.name
                    ))
                })?
                .clone();
            let target = self.registry.require(&relationship.target)?;
            let new_alias = format!("{}{}", self.alias_prefix, self.next_alias);
            self.next_alias += 1;

            let (parent_col, child_col) = if relationship.is_to_many() {
                (
                    relationship.joined_pk_column.as_str(),
                    relationship.fk_column.as_str(),
                )
            } else {
                (
                    relationship.fk_column.as_str(),
                    relationship.joined_pk_column.as_str(),
                )
            };
            self.joins.push(format!(
                "LEFT JOIN {} {} ON {}.{} = {}.{}",
                self.dialect.quote_identifier(&target.table),
                self.dialect.quote_identifier(&new_alias),
                self.dialect.quote_identifier(&alias),
                self.dialect.quote_identifier(parent_col),
                self.dialect.quote_identifier(&new_alias),
                self.dialect.quote_identifier(child_col),
            ));
            self.alias_by_path
                .insert(key.clone(), (new_alias.clone(), Arc::clone(&target)));
            alias = new_alias;
            entity = target;
        }
        Ok((alias, entity))
    }
}

impl PathResolver for SelectBuilder<'_> {
    fn resolve_path(&mut self, path: &str) -> Result<String> {
        let segments: Vec<&str> = path.split('.').collect();
        let (relationship_segments, attribute) = segments.split_at(segments.len() - 1);
        // Qualifier or ordering fan-out through a to-many calls for
        // DISTINCT on the primary row set.
        let mut walker = Arc::clone(&self.root);
        for segment in relationship_segments {
            if let Some(relationship) = walker.relationship_named(segment) {
                if relationship.is_to_many() {
                    self.crossed_to_many = true;
                }
                walker = self.registry.require(&relationship.target)?;
            } else {
                break;
            }
        }
        let (alias, entity) = self.join_path(relationship_segments)?;
        let attribute = entity.attribute_named(attribute[0]).ok_or_else(|| {
            Error::translation(format!(
                "no attribute '{}' on entity '{}'",
                attribute[0], entity.name
            ))
        })?;
        Ok(format!(
            "{}.{}",
            self.dialect.quote_identifier(&alias),
            self.dialect.quote_identifier(&attribute.column),
        ))
    }
}
