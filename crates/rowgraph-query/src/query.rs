//! Object queries.

use crate::expr::Expr;
use crate::ordering::Ordering;
use crate::prefetch::{PrefetchSemantics, PrefetchTree};
use rowgraph_core::{ObjectId, Value};
use std::time::Duration;

/// A fetch of persistent objects of one entity.
///
/// Built fluently and handed to a session; the translator turns it into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectQuery {
    /// Root entity name.
    pub entity: String,
    /// Optional qualifier narrowing the fetched rows.
    pub qualifier: Option<Expr>,
    /// Result orderings, applied in sequence.
    pub orderings: Vec<Ordering>,
    /// Relationships to resolve along with the roots.
    pub prefetch: PrefetchTree,
    /// Maximum number of root objects to fetch.
    pub limit: Option<u64>,
    /// Number of leading root rows to skip.
    pub offset: Option<u64>,
    /// Whether fetched rows overwrite cached snapshots and refresh committed
    /// objects. Non-refreshing fetches prefer cached data.
    pub refreshing: bool,
    /// Abort the fetch if row reading exceeds this budget.
    pub timeout: Option<Duration>,
}

impl ObjectQuery {
    /// Fetch all objects of the given entity.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            qualifier: None,
            orderings: Vec::new(),
            prefetch: PrefetchTree::new(),
            limit: None,
            offset: None,
            refreshing: true,
            timeout: None,
        }
    }

    /// Fetch one object by identity. Permanent ids only; temporary ids have
    /// no database row to match.
    pub fn for_id(id: &ObjectId) -> Self {
        let mut query = Self::new(id.entity());
        let mut qualifier: Option<Expr> = None;
        for (column, value) in id.key_pairs() {
            let term = Expr::path(column).eq(value.clone());
            qualifier = Some(match qualifier {
                Some(q) => q.and(term),
                None => term,
            });
        }
        query.qualifier = qualifier;
        query
    }

    /// Narrow the fetch with a qualifier, ANDing with any existing one.
    #[must_use]
    pub fn filter(mut self, expr: Expr) -> Self {
        self.qualifier = Some(match self.qualifier {
            Some(q) => q.and(expr),
            None => expr,
        });
        self
    }

    /// Append an ordering.
    #[must_use]
    pub fn order_by(mut self, ordering: Ordering) -> Self {
        self.orderings.push(ordering);
        self
    }

    /// Prefetch a relationship path with explicit semantics.
    #[must_use]
    pub fn prefetch(mut self, path: &str, semantics: PrefetchSemantics) -> Self {
        self.prefetch.add(path, semantics);
        self
    }

    /// Cap the number of fetched root objects.
    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip leading root rows.
    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Control snapshot refreshing.
    #[must_use]
    pub fn refreshing(mut self, refreshing: bool) -> Self {
        self.refreshing = refreshing;
        self
    }

    /// Bound the fetch's row-reading time.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fetch of one object's lazy column, issued when an unresolved attribute
/// slot is first read.
#[derive(Debug, Clone)]
pub struct AttributeFaultQuery {
    /// Identity of the faulting object.
    pub id: ObjectId,
    /// Column to fetch.
    pub column: String,
}

/// Translated SQL plus its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgraph_core::Value;

    #[test]
    fn test_filter_ands_qualifiers() {
        let q = ObjectQuery::new("Artist")
            .filter(Expr::path("name").eq("Picasso"))
            .filter(Expr::path("year").gt(1900));
        let paths = q.qualifier.unwrap().paths().len();
        assert_eq!(paths, 2);
    }

    #[test]
    fn test_for_id_builds_pk_qualifier() {
        let id = ObjectId::new(
            "Lineage",
            vec![
                ("parent_id".to_string(), Value::BigInt(1)),
                ("child_id".to_string(), Value::BigInt(2)),
            ],
        );
        let q = ObjectQuery::for_id(&id);
        assert_eq!(q.entity, "Lineage");
        let qualifier = q.qualifier.unwrap();
        assert_eq!(qualifier.paths(), vec!["child_id", "parent_id"]);
    }

    #[test]
    fn test_defaults() {
        let q = ObjectQuery::new("Artist");
        assert!(q.refreshing);
        assert!(q.limit.is_none());
        assert!(q.prefetch.is_empty());
    }
}
