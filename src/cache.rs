//! A decoded-block cache keyed by `block_id` holding weak
//! references (so memory pressure can reclaim entries without an explicit
//! invalidation call) plus a small fixed-capacity LRU for hot path lookups
//! such as folder path -> folder snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

/// Weak-referenced decoded-block cache. A block survives here only as long
/// as something else (the caller) still holds its `Arc`; `sweep()` drops
/// dead entries and, past `soft_cap`, evicts the oldest-accessed survivors.
pub struct BlockCache {
    entries: RwLock<HashMap<i64, (Weak<Vec<u8>>, u64)>>,
    soft_cap: usize,
    clock: std::sync::atomic::AtomicU64,
}

impl BlockCache {
    pub fn new(soft_cap: usize) -> Self {
        Self { entries: RwLock::new(HashMap::new()), soft_cap, clock: std::sync::atomic::AtomicU64::new(0) }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get(&self, block_id: i64) -> Option<Arc<Vec<u8>>> {
        let upgraded = self.entries.read().get(&block_id).and_then(|(weak, _)| weak.upgrade());
        if upgraded.is_some() {
            let tick = self.tick();
            if let Some(entry) = self.entries.write().get_mut(&block_id) {
                entry.1 = tick;
            }
        }
        upgraded
    }

    pub fn insert(&self, block_id: i64, value: &Arc<Vec<u8>>) {
        let tick = self.tick();
        self.entries.write().insert(block_id, (Arc::downgrade(value), tick));
    }

    /// Drops dead weak references, then if still over `soft_cap`, evicts
    /// the least-recently-accessed survivors until back under the cap.
    pub fn sweep(&self) {
        let mut entries = self.entries.write();
        entries.retain(|_, (weak, _)| weak.strong_count() > 0);
        if entries.len() > self.soft_cap {
            let mut by_age: Vec<(i64, u64)> = entries.iter().map(|(id, (_, tick))| (*id, *tick)).collect();
            by_age.sort_by_key(|(_, tick)| *tick);
            let excess = entries.len() - self.soft_cap;
            for (id, _) in by_age.into_iter().take(excess) {
                entries.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Thread-safe bounded LRU for small, frequently-recomputed lookups (e.g.
/// folder path -> folder_id). Wraps the `lru` crate's cache, which is not
/// itself `Sync`, behind a `parking_lot::Mutex`.
pub struct HotLookupCache<K: std::hash::Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: std::hash::Hash + Eq, V: Clone> HotLookupCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        self.inner.lock().put(key, value);
    }

    pub fn invalidate(&self, key: &K) {
        self.inner.lock().pop(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_none_after_drop() {
        let cache = BlockCache::new(10);
        {
            let value = Arc::new(vec![1, 2, 3]);
            cache.insert(1, &value);
            assert_eq!(cache.get(1), Some(value));
        }
        cache.sweep();
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn sweep_evicts_oldest_past_soft_cap() {
        let cache = BlockCache::new(2);
        let keep_alive: Vec<Arc<Vec<u8>>> = (0..3).map(|i| Arc::new(vec![i as u8])).collect();
        for (i, value) in keep_alive.iter().enumerate() {
            cache.insert(i as i64, value);
        }
        cache.sweep();
        assert_eq!(cache.len(), 2);
        assert!(cache.get(0).is_none());
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn hot_lookup_cache_roundtrip_and_eviction() {
        let cache: HotLookupCache<String, u64> = HotLookupCache::new(2);
        cache.put("A".to_string(), 1);
        cache.put("B".to_string(), 2);
        cache.put("C".to_string(), 3);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&"A".to_string()).is_none());
        assert_eq!(cache.get(&"C".to_string()), Some(3));
    }

    #[test]
    fn hot_lookup_invalidate_removes_entry() {
        let cache: HotLookupCache<String, u64> = HotLookupCache::new(4);
        cache.put("A".to_string(), 1);
        cache.invalidate(&"A".to_string());
        assert_eq!(cache.get(&"A".to_string()), None);
    }
}
