//! Content cache for materialized objects.

use std::sync::Mutex;

use lru::LruCache;
use odb_types::{EncodedObject, ObjectHash};

/// Memoizes recently materialized objects and delta bases.
pub trait ObjectCache: Send + Sync {
    fn get(&self, hash: &ObjectHash) -> Option<EncodedObject>;

    fn put(&self, object: EncodedObject);

    fn clear(&self);
}

struct LruState {
    entries: LruCache<ObjectHash, EncodedObject>,
    used: usize,
}

/// LRU cache bounded by the total size of the cached bodies.
///
/// An object larger than the whole capacity is never admitted.
pub struct ObjectLru {
    capacity: usize,
    state: Mutex<LruState>,
}

impl ObjectLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState {
                entries: LruCache::unbounded(),
                used: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently held.
    pub fn used(&self) -> usize {
        self.state.lock().expect("lock poisoned").used
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectCache for ObjectLru {
    fn get(&self, hash: &ObjectHash) -> Option<EncodedObject> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.entries.get(hash).cloned()
    }

    fn put(&self, object: EncodedObject) {
        let size = object.data().len();
        if size > self.capacity {
            return;
        }
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(old) = state.entries.put(object.hash(), object) {
            state.used -= old.data().len();
        }
        state.used += size;
        while state.used > self.capacity {
            match state.entries.pop_lru() {
                Some((_, evicted)) => state.used -= evicted.data().len(),
                None => break,
            }
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.entries.clear();
        state.used = 0;
    }
}

impl std::fmt::Debug for ObjectLru {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLru")
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_types::{ObjectFormat, ObjectType};

    fn blob(content: &[u8]) -> EncodedObject {
        EncodedObject::new(ObjectFormat::Sha1, ObjectType::Blob, content.to_vec())
    }

    #[test]
    fn get_after_put() {
        let cache = ObjectLru::new(1024);
        let obj = blob(b"cached");
        cache.put(obj.clone());
        assert_eq!(cache.get(&obj.hash()), Some(obj));
        assert_eq!(cache.used(), 6);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ObjectLru::new(10);
        let a = blob(b"aaaa");
        let b = blob(b"bbbb");
        let c = blob(b"cccc");
        cache.put(a.clone());
        cache.put(b.clone());
        // Touch `a` so `b` is the oldest.
        assert!(cache.get(&a.hash()).is_some());
        cache.put(c.clone());

        assert!(cache.get(&a.hash()).is_some());
        assert!(cache.get(&b.hash()).is_none());
        assert!(cache.get(&c.hash()).is_some());
        assert_eq!(cache.used(), 8);
    }

    #[test]
    fn oversized_object_is_not_admitted() {
        let cache = ObjectLru::new(4);
        cache.put(blob(b"too large"));
        assert!(cache.is_empty());
        assert_eq!(cache.used(), 0);
    }

    #[test]
    fn reinsert_does_not_double_count() {
        let cache = ObjectLru::new(100);
        let a = blob(b"same");
        cache.put(a.clone());
        cache.put(a);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used(), 4);
    }

    #[test]
    fn clear_resets_usage() {
        let cache = ObjectLru::new(100);
        cache.put(blob(b"x"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.used(), 0);
    }
}
