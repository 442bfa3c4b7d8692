//! Bounded LRU of open extent handles.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::extent::Extent;

/// LRU cache of open extent handles (descriptor plus loaded header).
/// Evicted handles close when their last reference drops.
pub struct ExtentCache {
    inner: Mutex<LruCache<u64, Arc<Extent>>>,
}

impl ExtentCache {
    /// Creates a cache bounded to `capacity` handles.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    /// Inserts or refreshes a handle.
    pub fn put(&self, extent: Arc<Extent>) {
        self.inner.lock().unwrap().put(extent.id(), extent);
    }

    /// Fetches a handle, refreshing its recency.
    pub fn get(&self, extent_id: u64) -> Option<Arc<Extent>> {
        self.inner.lock().unwrap().get(&extent_id).cloned()
    }

    /// Drops a handle.
    pub fn del(&self, extent_id: u64) {
        self.inner.lock().unwrap().pop(&extent_id);
    }

    /// Drops every handle.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    /// Fsyncs every cached handle.
    pub fn flush(&self) {
        let handles: Vec<Arc<Extent>> = {
            let cache = self.inner.lock().unwrap();
            cache.iter().map(|(_, e)| Arc::clone(e)).collect()
        };
        for extent in handles {
            let _ = extent.flush();
        }
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_extent(dir: &std::path::Path, id: u64) -> Arc<Extent> {
        let path = dir.join(id.to_string());
        Arc::new(Extent::create(&path, id, 0, false).unwrap())
    }

    #[test]
    fn test_put_get_del() {
        let dir = tempdir().unwrap();
        let cache = ExtentCache::new(4);
        let e = make_extent(dir.path(), 2);
        cache.put(Arc::clone(&e));
        assert_eq!(cache.get(2).unwrap().id(), 2);
        cache.del(2);
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let dir = tempdir().unwrap();
        let cache = ExtentCache::new(2);
        for id in 2..5 {
            cache.put(make_extent(dir.path(), id));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(2).is_none(), "oldest handle evicted");
        assert!(cache.get(4).is_some());
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let cache = ExtentCache::new(4);
        cache.put(make_extent(dir.path(), 2));
        cache.put(make_extent(dir.path(), 3));
        cache.clear();
        assert!(cache.is_empty());
    }
}
