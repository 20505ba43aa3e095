//! Bounded LRU compile cache.
//!
//! Keyed by the template source string itself. Thread-safe: concurrent
//! `renderString` calls may race on compilation, but the cache must never
//! corrupt its internal map or exceed `max_entries` by more than the
//! concurrency degree in flight.

use std::sync::{Arc, Mutex};

use lru::LruCache;

use super::CompiledTemplate;

/// Snapshot of cache occupancy, exposed to callers for observability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub enabled: bool,
    pub current_size: usize,
    pub max_size: usize,
}

impl CacheStats {
    pub fn usage_ratio(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.current_size as f64 / self.max_size as f64
        }
    }
}

enum Inner {
    Disabled,
    Bounded(Mutex<LruCache<String, Arc<CompiledTemplate>>>),
}

/// Compile cache used by [`super::TemplateEngine`].
///
/// `max_entries = 0` disables the cache entirely: every render recompiles,
/// and `stats()` reports `enabled = false`.
pub struct TemplateCache {
    inner: Inner,
    max_entries: usize,
}

impl TemplateCache {
    pub fn new(max_entries: usize) -> Self {
        let inner = match std::num::NonZeroUsize::new(max_entries) {
            Some(n) => Inner::Bounded(Mutex::new(LruCache::new(n))),
            None => Inner::Disabled,
        };
        Self { inner, max_entries }
    }

    /// Fetch a cached compiled template, if present. Touches LRU order.
    pub fn get(&self, key: &str) -> Option<Arc<CompiledTemplate>> {
        match &self.inner {
            Inner::Disabled => None,
            Inner::Bounded(m) => m.lock().unwrap().get(key).cloned(),
        }
    }

    /// Insert a freshly compiled template. A no-op when the cache is
    /// disabled. Evicts the least-recently-used entry when at capacity;
    /// double-insert under contention is acceptable (last writer wins) and
    /// never exceeds `max_entries` in a quiescent state.
    pub fn insert(&self, key: String, compiled: Arc<CompiledTemplate>) {
        if let Inner::Bounded(m) = &self.inner {
            m.lock().unwrap().put(key, compiled);
        }
    }

    pub fn stats(&self) -> CacheStats {
        match &self.inner {
            Inner::Disabled => CacheStats {
                enabled: false,
                current_size: 0,
                max_size: 0,
            },
            Inner::Bounded(m) => CacheStats {
                enabled: true,
                current_size: m.lock().unwrap().len(),
                max_size: self.max_entries,
            },
        }
    }

    pub fn clear(&self) {
        if let Inner::Bounded(m) = &self.inner {
            m.lock().unwrap().clear();
        }
    }
}
