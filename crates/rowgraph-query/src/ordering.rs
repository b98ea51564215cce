//! Result orderings.

use crate::expr::{Dialect, PathResolver};
use rowgraph_core::Result;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    /// SQL keyword for this direction.
    pub const fn as_str(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

/// One ORDER BY term over an entity path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ordering {
    /// Entity path the ordering sorts on.
    pub path: String,
    /// Sort direction.
    pub direction: SortDirection,
    /// Sort on LOWER(column) instead of the raw column.
    pub case_insensitive: bool,
}

impl Ordering {
    /// Ascending ordering on the given path.
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Ascending,
            case_insensitive: false,
        }
    }

    /// Descending ordering on the given path.
    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Descending,
            case_insensitive: false,
        }
    }

    /// Sort case-insensitively.
    #[must_use]
    pub fn insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Render the ORDER BY term, resolving the path to its aliased column.
    pub fn build(&self, _dialect: Dialect, resolver: &mut dyn PathResolver) -> Result<String> {
        let column = resolver.resolve_path(&self.path)?;
        let term = if self.case_insensitive {
            format!("LOWER({column})")
        } else {
            column
        };
        Ok(format!("{term} {}", self.direction.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    impl PathResolver for Bare {
        fn resolve_path(&mut self, path: &str) -> Result<String> {
            Ok(format!("\"t0\".\"{path}\""))
        }
    }

    #[test]
    fn test_ordering_renders_direction() {
        let sql = Ordering::desc("name").build(Dialect::Postgres, &mut Bare).unwrap();
        assert_eq!(sql, "\"t0\".\"name\" DESC");
    }

    #[test]
    fn test_case_insensitive_wraps_lower() {
        let sql = Ordering::asc("name")
            .insensitive()
            .build(Dialect::Postgres, &mut Bare)
            .unwrap();
        assert_eq!(sql, "LOWER(\"t0\".\"name\") ASC");
    }
}
