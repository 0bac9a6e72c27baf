//! LRU cache of compiled document filters.

use super::compile::CompiledFilter;
use crate::error::Result;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Compiled filters keyed by source text, so notify never recompiles.
pub struct FilterCache {
    cache: Mutex<LruCache<String, Arc<CompiledFilter>>>,
}

impl FilterCache {
    /// Cache holding at most `capacity` compiled filters.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Return the cached filter for `source`, compiling it on a miss.
    pub fn get_or_compile(&self, source: &str) -> Result<Arc<CompiledFilter>> {
        if let Some(hit) = self.cache.lock().get(source) {
            return Ok(Arc::clone(hit));
        }

        // Compile outside the lock; a racing compile of the same text is harmless.
        let compiled = Arc::new(CompiledFilter::compile(source)?);
        self.cache
            .lock()
            .put(source.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FilterCache {
    fn default() -> Self {
        Self::new(256)
    }
}
