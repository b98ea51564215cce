//! Database result row representation.

use crate::error::{Error, Result, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared across all rows in a result set.
///
/// Wrapped in `Arc` so every row from one query shares the same column
/// information instead of carrying its own name list.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column names in SELECT order
    names: Vec<String>,
    /// Name -> index mapping for O(1) lookup
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get the name of a column by index.
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Check if a column exists.
    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    /// Get all column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned from a database query.
#[derive(Debug, Clone)]
pub struct Row {
    /// Column values in SELECT order
    values: Vec<Value>,
    /// Shared column metadata
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    ///
    /// For multiple rows from the same result set, prefer `with_columns`
    /// to share the column metadata.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Get the shared column metadata.
    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    /// Get the number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this row is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a value by column name, or a typed error naming the column.
    pub fn require(&self, name: &str) -> Result<&Value> {
        self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: "column",
                actual: "missing".to_string(),
                column: Some(name.to_string()),
            })
        })
    }

    /// Check if a column exists by name.
    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.contains(name)
    }

    /// Consume the row, returning its values in column order.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Row {
        Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![Value::BigInt(1), Value::Text("Picasso".to_string())],
        )
    }

    #[test]
    fn test_access_by_index_and_name() {
        let row = sample();
        assert_eq!(row.get(0), Some(&Value::BigInt(1)));
        assert_eq!(row.get_by_name("name"), Some(&Value::Text("Picasso".to_string())));
        assert_eq!(row.get_by_name("nope"), None);
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_shared_column_info() {
        let row = sample();
        let cols = row.column_info();
        let second = Row::with_columns(
            Arc::clone(&cols),
            vec![Value::BigInt(2), Value::Text("Dali".to_string())],
        );
        assert_eq!(second.get_by_name("id"), Some(&Value::BigInt(2)));
        assert!(Arc::ptr_eq(&cols, &second.column_info()));
    }

    #[test]
    fn test_require_reports_column() {
        let row = sample();
        assert!(row.require("id").is_ok());
        let err = row.require("missing").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
