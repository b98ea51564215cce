//! Row identities: the (entity, primary key) tuple naming one logical row.
//!
//! An [`ObjectId`] is either *permanent* (backed by real primary-key values)
//! or *temporary* (a process-unique surrogate handed to a new object before
//! its INSERT runs). Temporary ids are replaced by permanent ones during
//! commit; the replacement is propagated by the graph store to every place
//! the temporary id was referenced.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counter for temporary id surrogates.
static NEXT_TEMP: AtomicU64 = AtomicU64::new(1);

/// Identity of one logical database row.
///
/// Equality and hashing cover the entity name and, for permanent ids, every
/// primary-key column/value pair; for temporary ids, the surrogate number.
/// The entity name is wrapped in an `Arc<str>` so ids clone cheaply — they
/// are copied into diffs, relationship holders, and cache keys constantly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    entity: Arc<str>,
    key: IdKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum IdKey {
    /// Real primary-key values, ordered by column name at construction.
    Permanent(Vec<(String, Value)>),
    /// Process-unique surrogate for a row not yet inserted.
    Temporary(u64),
}

impl ObjectId {
    /// Create a permanent id from primary-key column/value pairs.
    ///
    /// Pairs are sorted by column name so the same logical key always
    /// produces an equal id regardless of construction order.
    pub fn new<C, I>(entity: impl Into<Arc<str>>, key: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = (C, Value)>,
    {
        let mut pairs: Vec<(String, Value)> =
            key.into_iter().map(|(c, v)| (c.into(), v)).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            entity: entity.into(),
            key: IdKey::Permanent(pairs),
        }
    }

    /// Create a single-column permanent id (the common case).
    pub fn single(entity: impl Into<Arc<str>>, column: impl Into<String>, value: Value) -> Self {
        Self::new(entity, [(column.into(), value)])
    }

    /// Create a fresh temporary id for a new object of the given entity.
    pub fn temporary(entity: impl Into<Arc<str>>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Temporary(NEXT_TEMP.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// The entity name this id belongs to.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Whether this is a temporary (pre-INSERT) id.
    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdKey::Temporary(_))
    }

    /// Primary-key column/value pairs; empty for temporary ids.
    pub fn key_pairs(&self) -> &[(String, Value)] {
        match &self.key {
            IdKey::Permanent(pairs) => pairs,
            IdKey::Temporary(_) => &[],
        }
    }

    /// Look up one primary-key column value.
    pub fn key_value(&self, column: &str) -> Option<&Value> {
        self.key_pairs().iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    /// For a single-column key, the sole value.
    pub fn single_key_value(&self) -> Option<&Value> {
        match self.key_pairs() {
            [(_, v)] => Some(v),
            _ => None,
        }
    }

    /// Derive the permanent replacement for this id, keeping the entity.
    pub fn with_permanent_key<C, I>(&self, key: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = (C, Value)>,
    {
        Self::new(Arc::clone(&self.entity), key)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdKey::Temporary(n) => write!(f, "{}:tmp-{n}", self.entity),
            IdKey::Permanent(pairs) => {
                write!(f, "{}:", self.entity)?;
                for (i, (col, val)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{col}={val:?}")?;
                }
                Ok(())
            }
        }
    }
}
