//! Database collaborator traits.
//!
//! The engine issues SQL through these traits and never opens connections
//! itself. Implementations wrap a driver (or, in tests, an in-memory table
//! set). All calls are synchronous; result sets come back as an explicit
//! [`RowCursor`] so callers control how far a read runs and can stop early
//! on timeout without the client buffering everything.

use crate::entity::Entity;
use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// Streaming result set. Dropping a cursor releases its statement.
pub trait RowCursor {
    /// Fetch the next row, or `None` when the result set is exhausted.
    fn next_row(&mut self) -> Result<Option<Row>>;
}

/// Drain a cursor into a vector.
pub fn fetch_all(cursor: &mut dyn RowCursor) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    while let Some(row) = cursor.next_row()? {
        rows.push(row);
    }
    Ok(rows)
}

/// Write operations inside an open transaction. Exactly one of
/// [`commit`](DbTransaction::commit) or [`rollback`](DbTransaction::rollback)
/// ends the transaction; dropping without either must roll back.
pub trait DbTransaction {
    /// Execute a statement, returning the affected row count.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute one statement once per parameter set, returning the total
    /// affected count. Drivers with native batch support should override
    /// this; the default runs the sets one by one.
    fn execute_batch(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> Result<u64> {
        let mut affected = 0;
        for params in param_sets {
            affected += self.execute(sql, params)?;
        }
        Ok(affected)
    }

    /// Commit the transaction.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Roll the transaction back.
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Synchronous SQL client.
pub trait DbClient: Send + Sync {
    /// Run a SELECT, returning a cursor over the result rows.
    fn select<'a>(&'a self, sql: &str, params: &[Value]) -> Result<Box<dyn RowCursor + 'a>>;

    /// Run a standalone non-SELECT statement, returning the affected count.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Open a transaction for commit-time writes.
    fn begin<'a>(&'a self) -> Result<Box<dyn DbTransaction + 'a>>;
}

/// Produces permanent primary-key values for inserted rows.
pub trait KeyGenerator: Send + Sync {
    /// Next key for the given entity's generated PK column.
    fn next_key(&self, entity: &Entity) -> Result<Value>;
}

/// Key generator backed by a shared atomic counter. Suitable for tests and
/// single-process embedding; production setups usually delegate to database
/// sequences.
#[derive(Debug, Default)]
pub struct CounterKeyGenerator {
    next: std::sync::atomic::AtomicI64,
}

impl CounterKeyGenerator {
    /// Start counting from the given value.
    pub fn starting_at(first: i64) -> Self {
        Self {
            next: std::sync::atomic::AtomicI64::new(first),
        }
    }
}

impl KeyGenerator for CounterKeyGenerator {
    fn next_key(&self, _entity: &Entity) -> Result<Value> {
        let key = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(Value::BigInt(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::ColumnInfo;
    use std::sync::Arc;

    struct FixedCursor {
        rows: Vec<Row>,
    }

    impl RowCursor for FixedCursor {
        fn next_row(&mut self) -> Result<Option<Row>> {
            if self.rows.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.rows.remove(0)))
            }
        }
    }

    #[test]
    fn test_fetch_all_drains_cursor() {
        let columns = Arc::new(ColumnInfo::new(vec!["id".to_string()]));
        let mut cursor = FixedCursor {
            rows: vec![
                Row::with_columns(Arc::clone(&columns), vec![Value::BigInt(1)]),
                Row::with_columns(columns, vec![Value::BigInt(2)]),
            ],
        };
        let rows = fetch_all(&mut cursor).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get(0), Some(&Value::BigInt(2)));
    }

    #[test]
    fn test_counter_generator_is_monotonic() {
        let g = CounterKeyGenerator::starting_at(100);
        let e = Entity::new("X", "x");
        assert_eq!(g.next_key(&e).unwrap(), Value::BigInt(100));
        assert_eq!(g.next_key(&e).unwrap(), Value::BigInt(101));
    }
}
