//! Translation caching.
//!
//! Caches complete [`SelectTranslation`]s keyed by a hash of the query
//! structure so repeated fetches of the same shape skip SQL building.

use crate::translator::SelectTranslation;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct CachedTranslation {
    translation: Arc<SelectTranslation>,
    last_used: Instant,
    hit_count: u64,
}

/// LRU-style cache for translated queries.
///
/// Keyed by a `u64` hash that callers compute from their query structure.
/// When the cache exceeds `max_size`, the least-recently-used entry is
/// evicted.
#[derive(Debug)]
pub struct TranslationCache {
    cache: HashMap<u64, CachedTranslation>,
    max_size: usize,
}

impl TranslationCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size,
        }
    }

    /// Get a cached translation or build and insert it.
    ///
    /// The `builder` closure is only called on cache miss; its error is
    /// returned without caching anything.
    pub fn get_or_insert(
        &mut self,
        key: u64,
        builder: impl FnOnce() -> rowgraph_core::Result<SelectTranslation>,
    ) -> rowgraph_core::Result<Arc<SelectTranslation>> {
        if !self.cache.contains_key(&key) && self.cache.len() >= self.max_size {
            self.evict_lru();
        }
        if let Some(entry) = self.cache.get_mut(&key) {
            entry.last_used = Instant::now();
            entry.hit_count += 1;
            return Ok(Arc::clone(&entry.translation));
        }
        let translation = Arc::new(builder()?);
        trace!(target: "rowgraph::translate", key, "statement cache miss");
        self.cache.insert(
            key,
            CachedTranslation {
                translation: Arc::clone(&translation),
                last_used: Instant::now(),
                hit_count: 0,
            },
        );
        Ok(translation)
    }

    /// Check if a translation is cached.
    pub fn contains(&self, key: u64) -> bool {
        self.cache.contains_key(&key)
    }

    /// Number of cached translations.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Clear all cached translations.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    fn evict_lru(&mut self) {
        if let Some((&lru_key, _)) = self.cache.iter().min_by_key(|(_, entry)| entry.last_used) {
            self.cache.remove(&lru_key);
        }
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Compute a hash key for caching from any hashable value.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgraph_core::ObjectId;
    use rowgraph_core::Value;

    fn fake_translation(sql: &str) -> SelectTranslation {
        SelectTranslation {
            statement: crate::query::SqlStatement {
                sql: sql.to_string(),
                params: Vec::new(),
            },
            segments: Vec::new(),
            secondaries: Vec::new(),
        }
    }

    #[test]
    fn test_hit_skips_builder() {
        let mut cache = TranslationCache::new(10);
        cache.get_or_insert(1, || Ok(fake_translation("a"))).unwrap();
        let hit = cache
            .get_or_insert(1, || panic!("builder must not run on hit"))
            .unwrap();
        assert_eq!(hit.statement.sql, "a");
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let mut cache = TranslationCache::new(2);
        cache.get_or_insert(1, || Ok(fake_translation("a"))).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.get_or_insert(2, || Ok(fake_translation("b"))).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.get_or_insert(1, || Ok(fake_translation("a"))).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.get_or_insert(3, || Ok(fake_translation("c"))).unwrap();
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn test_builder_error_is_not_cached() {
        let mut cache = TranslationCache::new(10);
        let err = cache.get_or_insert(9, || {
            Err(rowgraph_core::Error::translation("boom"))
        });
        assert!(err.is_err());
        assert!(!cache.contains(9));
    }

    #[test]
    fn test_cache_key_is_stable() {
        let id = ObjectId::single("Artist", "id", Value::BigInt(1));
        assert_eq!(cache_key(&id), cache_key(&id));
    }
}
