//! Mapping metadata: entities, attributes, relationships.
//!
//! The engine never reads mapping configuration itself; a populated
//! [`ModelRegistry`] is handed in by the embedding application. The registry
//! is the runtime analogue of static per-type field metadata: everything the
//! translator, resolver, and commit planner need to know about the schema
//! lives here.

use crate::error::{Error, Result};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Cardinality of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// To-one: the owner holds the foreign key (or shares the PK).
    ToOne,
    /// To-many: the target rows hold a foreign key back to the owner.
    ToMany,
}

/// Policy applied to a relationship's target when its source is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteRule {
    /// Delete dependent target objects as well.
    Cascade,
    /// Refuse the delete while related objects exist.
    Deny,
    /// Clear the foreign key on related rows, keep the targets.
    Nullify,
    /// Do nothing.
    #[default]
    NoAction,
}

/// One mapped attribute (column) of an entity.
#[derive(Debug, Clone)]
pub struct Attribute {
    /// Attribute name as seen by object code.
    pub name: String,
    /// Underlying column name.
    pub column: String,
    /// Whether the column is excluded from entity SELECTs and fetched on
    /// first access with a targeted single-row query.
    pub lazy: bool,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
    /// Whether the key value is produced by the key generator on insert.
    pub generated: bool,
}

impl Attribute {
    /// Create a plain attribute whose column name equals its name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            lazy: false,
            primary_key: false,
            generated: false,
        }
    }

    /// Use a different underlying column name.
    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Mark the attribute as lazily fetched.
    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Mark the attribute as (part of) the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Mark the key as generator-assigned on insert.
    #[must_use]
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }
}

/// One mapped relationship of an entity.
#[derive(Debug, Clone)]
pub struct Relationship {
    /// Relationship name as seen by object code.
    pub name: String,
    /// Target entity name.
    pub target: String,
    /// Cardinality from the owner's point of view.
    pub cardinality: Cardinality,
    /// Foreign-key column on the *owning side*: for to-one this is a column
    /// on the owner's table; for to-many it is a column on the target table
    /// pointing back at the owner.
    pub fk_column: String,
    /// Primary-key column the FK joins to (owner PK for to-many, target PK
    /// for to-one).
    pub joined_pk_column: String,
    /// Delete rule applied when the owner is deleted.
    pub delete_rule: DeleteRule,
    /// Name of the reverse relationship on the target entity, if mapped.
    pub reverse: Option<String>,
}

impl Relationship {
    /// Create a to-one relationship (FK lives on the owner).
    pub fn to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        fk_column: impl Into<String>,
        target_pk_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::ToOne,
            fk_column: fk_column.into(),
            joined_pk_column: target_pk_column.into(),
            delete_rule: DeleteRule::default(),
            reverse: None,
        }
    }

    /// Create a to-many relationship (FK lives on the target table).
    pub fn to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        fk_column: impl Into<String>,
        owner_pk_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::ToMany,
            fk_column: fk_column.into(),
            joined_pk_column: owner_pk_column.into(),
            delete_rule: DeleteRule::default(),
            reverse: None,
        }
    }

    /// Set the delete rule.
    #[must_use]
    pub fn delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    /// Name the reverse relationship on the target entity.
    #[must_use]
    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }

    /// Whether this is a to-many relationship.
    pub fn is_to_many(&self) -> bool {
        self.cardinality == Cardinality::ToMany
    }
}

/// Single-table inheritance mapping: a discriminator column plus the
/// discriminator-value → sub-entity table.
#[derive(Debug, Clone, Default)]
pub struct Inheritance {
    /// Column inspected to pick the concrete sub-entity.
    pub discriminator_column: String,
    /// Discriminator value → concrete entity name.
    pub variants: Vec<(Value, String)>,
}

impl Inheritance {
    /// Create an inheritance mapping on the given column.
    pub fn new(discriminator_column: impl Into<String>) -> Self {
        Self {
            discriminator_column: discriminator_column.into(),
            variants: Vec::new(),
        }
    }

    /// Register a discriminator value → sub-entity pairing.
    #[must_use]
    pub fn variant(mut self, value: Value, entity: impl Into<String>) -> Self {
        self.variants.push((value, entity.into()));
        self
    }

    /// Resolve a discriminator value to its concrete entity name.
    pub fn resolve(&self, value: &Value) -> Option<&str> {
        self.variants
            .iter()
            .find(|(v, _)| v == value)
            .map(|(_, e)| e.as_str())
    }
}

/// One mapped entity.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Entity name.
    pub name: String,
    /// Underlying table name.
    pub table: String,
    /// Mapped attributes, in mapping order.
    pub attributes: Vec<Attribute>,
    /// Mapped relationships.
    pub relationships: Vec<Relationship>,
    /// Single-table inheritance mapping, if any.
    pub inheritance: Option<Inheritance>,
}

impl Entity {
    /// Create an entity mapped to the given table.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            inheritance: None,
        }
    }

    /// Add an attribute (builder pattern).
    #[must_use]
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Add a relationship (builder pattern).
    #[must_use]
    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Attach an inheritance mapping (builder pattern).
    #[must_use]
    pub fn inheritance(mut self, inheritance: Inheritance) -> Self {
        self.inheritance = Some(inheritance);
        self
    }

    /// Primary-key column names, in mapping order.
    pub fn pk_columns(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|a| a.primary_key)
            .map(|a| a.column.as_str())
            .collect()
    }

    /// Columns excluded from entity SELECTs (lazy attributes).
    pub fn lazy_columns(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|a| a.lazy)
            .map(|a| a.column.as_str())
            .collect()
    }

    /// Non-lazy columns, in mapping order.
    pub fn fetched_columns(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|a| !a.lazy)
            .map(|a| a.column.as_str())
            .collect()
    }

    /// Look up an attribute by name.
    pub fn attribute_named(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Look up a relationship by name.
    pub fn relationship_named(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// The generator-assigned PK attribute, if the entity has one.
    pub fn generated_pk(&self) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.primary_key && a.generated)
    }
}

/// Registry of all mapped entities. Shared immutably across sessions.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    entities: HashMap<String, Arc<Entity>>,
}

impl ModelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity. Later registrations replace earlier ones.
    pub fn register(&mut self, entity: Entity) {
        self.entities.insert(entity.name.clone(), Arc::new(entity));
    }

    /// Look up an entity by name.
    pub fn get(&self, name: &str) -> Option<Arc<Entity>> {
        self.entities.get(name).cloned()
    }

    /// Look up an entity, or a mapping error naming it.
    pub fn require(&self, name: &str) -> Result<Arc<Entity>> {
        self.get(name)
            .ok_or_else(|| Error::Mapping(format!("unknown entity '{name}'")))
    }

    /// Entities that depend (via a to-one FK) on the given entity.
    ///
    /// Used by the commit planner to build delete ordering and by delete
    /// rules to find dependent rows.
    pub fn dependents_of(&self, entity: &str) -> Vec<(Arc<Entity>, Relationship)> {
        let mut out = Vec::new();
        for e in self.entities.values() {
            for r in &e.relationships {
                if r.cardinality == Cardinality::ToOne && r.target == entity {
                    out.push((Arc::clone(e), r.clone()));
                }
            }
        }
        out
    }

    /// All registered entity names.
    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artist() -> Entity {
        Entity::new("Artist", "artist")
            .attribute(Attribute::new("id").primary_key().generated())
            .attribute(Attribute::new("name"))
            .attribute(Attribute::new("biography").lazy())
            .relationship(
                Relationship::to_many("paintings", "Painting", "artist_id", "id")
                    .delete_rule(DeleteRule::Cascade)
                    .reverse("artist"),
            )
    }

    #[test]
    fn test_pk_and_lazy_columns() {
        let e = artist();
        assert_eq!(e.pk_columns(), vec!["id"]);
        assert_eq!(e.lazy_columns(), vec!["biography"]);
        assert_eq!(e.fetched_columns(), vec!["id", "name"]);
        assert!(e.generated_pk().is_some());
    }

    #[test]
    fn test_lookup_by_name() {
        let e = artist();
        assert!(e.attribute_named("name").is_some());
        assert!(e.attribute_named("nope").is_none());
        let rel = e.relationship_named("paintings").unwrap();
        assert!(rel.is_to_many());
        assert_eq!(rel.delete_rule, DeleteRule::Cascade);
        assert_eq!(rel.reverse.as_deref(), Some("artist"));
    }

    #[test]
    fn test_registry_require() {
        let mut reg = ModelRegistry::new();
        reg.register(artist());
        assert!(reg.require("Artist").is_ok());
        let err = reg.require("Gallery").unwrap_err();
        assert!(err.to_string().contains("Gallery"));
    }

    #[test]
    fn test_dependents_of() {
        let mut reg = ModelRegistry::new();
        reg.register(artist());
        reg.register(
            Entity::new("Painting", "painting")
                .attribute(Attribute::new("id").primary_key().generated())
                .attribute(Attribute::new("title"))
                .attribute(Attribute::new("artist_id"))
                .relationship(Relationship::to_one("artist", "Artist", "artist_id", "id")),
        );
        let deps = reg.dependents_of("Artist");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].0.name, "Painting");
        assert_eq!(deps[0].1.fk_column, "artist_id");
        assert!(reg.dependents_of("Painting").is_empty());
    }

    #[test]
    fn test_inheritance_resolution() {
        let inh = Inheritance::new("kind")
            .variant(Value::Text("oil".to_string()), "OilPainting")
            .variant(Value::Text("ink".to_string()), "InkDrawing");
        assert_eq!(
            inh.resolve(&Value::Text("oil".to_string())),
            Some("OilPainting")
        );
        assert_eq!(inh.resolve(&Value::Text("etching".to_string())), None);
    }
}
