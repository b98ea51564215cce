//! Row snapshots: last-known database state for one identity.
//!
//! A [`Snapshot`] is the payload of the shared row cache and the baseline
//! for merge/diff computation during commit. Snapshots may be *partial*:
//! a column whose attribute is mapped as lazily-fetched is recorded as
//! [`AttributeValue::Unresolved`], which is distinct from both NULL and
//! absent-from-map.

use crate::row::Row;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One column slot in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// The column was read from the database (possibly NULL).
    Resolved(Value),
    /// The column was deliberately omitted from the SELECT (lazy attribute)
    /// and has not been fetched yet.
    Unresolved,
}

impl AttributeValue {
    /// The resolved value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            AttributeValue::Resolved(v) => Some(v),
            AttributeValue::Unresolved => None,
        }
    }

    /// Whether this slot holds a fetched value.
    pub fn is_resolved(&self) -> bool {
        matches!(self, AttributeValue::Resolved(_))
    }
}

/// Column-name → value mapping representing last-known database state.
///
/// Backed by a `BTreeMap` so iteration order is deterministic, which keeps
/// generated batch SQL stable for same-shape detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    columns: BTreeMap<String, AttributeValue>,
}

impl Snapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from resolved column/value pairs.
    pub fn from_pairs<C, I>(pairs: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = (C, Value)>,
    {
        Self {
            columns: pairs
                .into_iter()
                .map(|(c, v)| (c.into(), AttributeValue::Resolved(v)))
                .collect(),
        }
    }

    /// Build a snapshot from a result row, marking `lazy_columns` as
    /// unresolved rather than simply leaving them out.
    pub fn from_row(row: &Row, lazy_columns: &[&str]) -> Self {
        let mut snapshot = Self::new();
        for name in row.column_info().names() {
            if let Some(value) = row.get_by_name(name) {
                snapshot.set(name.clone(), value.clone());
            }
        }
        for lazy in lazy_columns {
            snapshot
                .columns
                .entry((*lazy).to_string())
                .or_insert(AttributeValue::Unresolved);
        }
        snapshot
    }

    /// Set a resolved column value.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.columns
            .insert(column.into(), AttributeValue::Resolved(value));
    }

    /// Mark a column as unresolved (lazy, not yet fetched).
    pub fn set_unresolved(&mut self, column: impl Into<String>) {
        self.columns
            .insert(column.into(), AttributeValue::Unresolved);
    }

    /// Get the slot for a column; `None` means the column is not mapped at
    /// all in this snapshot.
    pub fn slot(&self, column: &str) -> Option<&AttributeValue> {
        self.columns.get(column)
    }

    /// Get a resolved column value; `None` for unresolved or unmapped.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column).and_then(AttributeValue::value)
    }

    /// Whether a column is present but awaiting a lazy fetch.
    pub fn is_unresolved(&self, column: &str) -> bool {
        matches!(self.columns.get(column), Some(AttributeValue::Unresolved))
    }

    /// Column names in deterministic (sorted) order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Iterate resolved column/value pairs.
    pub fn resolved_pairs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().filter_map(|(c, av)| match av {
            AttributeValue::Resolved(v) => Some((c.as_str(), v)),
            AttributeValue::Unresolved => None,
        })
    }

    /// Number of column slots (resolved or not).
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the snapshot has no column slots.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Overlay another snapshot's *resolved* columns onto this one.
    ///
    /// Unresolved slots in `other` never clobber resolved values here; they
    /// only claim columns this snapshot does not know about.
    pub fn merge(&mut self, other: &Snapshot) {
        for (column, slot) in &other.columns {
            match slot {
                AttributeValue::Resolved(v) => {
                    self.columns
                        .insert(column.clone(), AttributeValue::Resolved(v.clone()));
                }
                AttributeValue::Unresolved => {
                    self.columns
                        .entry(column.clone())
                        .or_insert(AttributeValue::Unresolved);
                }
            }
        }
    }

    /// Columns whose resolved values differ from `baseline`.
    ///
    /// A column only counts as changed when both sides have a resolved view
    /// of it or when it is newly resolved here; unresolved slots never
    /// produce phantom changes.
    pub fn changed_columns(&self, baseline: &Snapshot) -> Vec<String> {
        let mut changed = Vec::new();
        for (column, slot) in &self.columns {
            let AttributeValue::Resolved(current) = slot else {
                continue;
            };
            match baseline.columns.get(column) {
                Some(AttributeValue::Resolved(old)) if old == current => {}
                Some(AttributeValue::Unresolved) => {}
                _ => changed.push(column.clone()),
            }
        }
        changed
    }
}
