use std::hash::Hash;

use lru::LruCache;

/// Recency-ordered bounded map. Eviction starts from the least recently used
/// entry but refuses pinned entries: a pinned candidate is touched back to
/// the recent end instead, and if every entry is pinned the cache grows past
/// its nominal capacity until the pins are released.
pub struct BoundedLruCache<K: Hash + Eq + Copy, V> {
    inner: LruCache<K, V>,
    capacity: usize,
}

impl<K: Hash + Eq + Copy, V> BoundedLruCache<K, V> {
    pub fn new(capacity: usize) -> BoundedLruCache<K, V> {
        BoundedLruCache {
            inner: LruCache::unbounded(),
            capacity,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn insert<P>(&mut self, key: K, value: V, pinned: P)
    where
        P: Fn(&K) -> bool,
    {
        self.inner.put(key, value);
        let mut attempts = self.inner.len();
        while self.inner.len() > self.capacity && attempts > 0 {
            attempts -= 1;
            if let Some((eldest_key, eldest_value)) = self.inner.pop_lru() {
                if pinned(&eldest_key) {
                    self.inner.put(eldest_key, eldest_value);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
