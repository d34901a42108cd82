use std::collections::HashMap;
use std::sync::RwLock;

use odb_types::{EncodedObject, ObjectHash, ObjectType};

use crate::error::{StoreError, StoreResult};
use crate::traits::{check_type, ObjectIter, ObjectStorer};

/// In-memory, HashMap-based object store.
///
/// Intended for tests, for staging objects before they are packed, and for
/// embedding. All objects are held behind a `RwLock`; reads hand out cheap
/// clones sharing the same body.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectHash, EncodedObject>>,
}

impl InMemoryObjectStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects
            .read()
            .expect("lock poisoned")
            .values()
            .map(|obj| obj.size())
            .sum()
    }

    /// Remove an object. Returns `true` if it existed.
    pub fn delete(&self, hash: &ObjectHash) -> bool {
        self.objects
            .write()
            .expect("lock poisoned")
            .remove(hash)
            .is_some()
    }

    /// Remove all objects from the store.
    pub fn clear(&self) {
        self.objects.write().expect("lock poisoned").clear();
    }

    /// Return a sorted list of all hashes in the store.
    pub fn all_hashes(&self) -> Vec<ObjectHash> {
        let map = self.objects.read().expect("lock poisoned");
        let mut hashes: Vec<ObjectHash> = map.keys().copied().collect();
        hashes.sort();
        hashes
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStorer for InMemoryObjectStore {
    fn get(&self, hash: &ObjectHash, wanted: ObjectType) -> StoreResult<EncodedObject> {
        let map = self.objects.read().expect("lock poisoned");
        let object = map.get(hash).cloned().ok_or(StoreError::NotFound(*hash))?;
        check_type(object, wanted)
    }

    fn has(&self, hash: &ObjectHash) -> StoreResult<bool> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.contains_key(hash))
    }

    fn size(&self, hash: &ObjectHash) -> StoreResult<u64> {
        let map = self.objects.read().expect("lock poisoned");
        map.get(hash)
            .map(|o| o.size())
            .ok_or(StoreError::NotFound(*hash))
    }

    fn put(&self, object: &EncodedObject) -> StoreResult<ObjectHash> {
        if !object.object_type().is_full() {
            return Err(StoreError::InvalidType(object.object_type()));
        }
        let hash = object.hash();
        let mut map = self.objects.write().expect("lock poisoned");
        map.entry(hash).or_insert_with(|| object.clone());
        Ok(hash)
    }

    fn iterate(&self, wanted: ObjectType) -> StoreResult<ObjectIter<'_>> {
        // Snapshot in hash order so the lock is not held by the iterator.
        let map = self.objects.read().expect("lock poisoned");
        let mut objects: Vec<EncodedObject> = map
            .values()
            .filter(|o| o.object_type().matches(wanted))
            .cloned()
            .collect();
        objects.sort_by_key(|o| o.hash());
        Ok(Box::new(objects.into_iter().map(Ok)))
    }

    fn find_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<ObjectHash>> {
        let map = self.objects.read().expect("lock poisoned");
        let mut hashes: Vec<ObjectHash> =
            map.keys().filter(|h| h.has_prefix(prefix)).copied().collect();
        hashes.sort();
        Ok(hashes)
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.len();
        f.debug_struct("InMemoryObjectStore")
            .field("object_count", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_types::ObjectFormat;

    fn make_blob(content: &[u8]) -> EncodedObject {
        EncodedObject::new(ObjectFormat::Sha1, ObjectType::Blob, content.to_vec())
    }

    fn make_commit(message: &str) -> EncodedObject {
        let body = format!(
            "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
             author A U Thor <author@example.com> 1700000000 +0000\n\
             committer A U Thor <author@example.com> 1700000000 +0000\n\n{message}\n"
        );
        EncodedObject::new(ObjectFormat::Sha1, ObjectType::Commit, body.into_bytes())
    }

    // -----------------------------------------------------------------------
    // Core operations
    // -----------------------------------------------------------------------

    #[test]
    fn put_and_get_blob() {
        let store = InMemoryObjectStore::new();
        let obj = make_blob(b"hello world");
        let hash = store.put(&obj).unwrap();
        assert_eq!(hash.to_hex(), "95d09f2b10159347eece71399a7e2e907ea3df4f");

        let read_back = store.get(&hash, ObjectType::Blob).unwrap();
        assert_eq!(read_back, obj);
        assert_eq!(store.size(&hash).unwrap(), 11);
    }

    #[test]
    fn get_with_wrong_type() {
        let store = InMemoryObjectStore::new();
        let hash = store.put(&make_commit("initial")).unwrap();
        let err = store.get(&hash, ObjectType::Tree).unwrap_err();
        assert!(matches!(
            err,
            StoreError::TypeMismatch {
                expected: ObjectType::Tree,
                actual: ObjectType::Commit,
                ..
            }
        ));
        assert!(store.get(&hash, ObjectType::Any).is_ok());
    }

    #[test]
    fn get_missing_object() {
        let store = InMemoryObjectStore::new();
        let hash = make_blob(b"missing").hash();
        assert!(matches!(
            store.get(&hash, ObjectType::Any),
            Err(StoreError::NotFound(h)) if h == hash
        ));
        assert!(!store.has(&hash).unwrap());
        assert!(store.size(&hash).is_err());
    }

    #[test]
    fn put_rejects_delta_objects() {
        let store = InMemoryObjectStore::new();
        let delta = EncodedObject::new(ObjectFormat::Sha1, ObjectType::OfsDelta, vec![1, 1, 0x90, 1]);
        assert!(matches!(
            store.put(&delta),
            Err(StoreError::InvalidType(ObjectType::OfsDelta))
        ));
        assert!(store.is_empty());
    }

    // -----------------------------------------------------------------------
    // Idempotency and deletion
    // -----------------------------------------------------------------------

    #[test]
    fn put_is_idempotent() {
        let store = InMemoryObjectStore::new();
        let obj = make_blob(b"idempotent");
        let h1 = store.put(&obj).unwrap();
        let h2 = store.put(&obj).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn delete_and_clear() {
        let store = InMemoryObjectStore::new();
        let hash = store.put(&make_blob(b"a")).unwrap();
        store.put(&make_blob(b"b")).unwrap();
        assert!(store.delete(&hash));
        assert!(!store.delete(&hash));
        assert_eq!(store.len(), 1);
        store.clear();
        assert!(store.is_empty());
    }

    // -----------------------------------------------------------------------
    // Enumeration
    // -----------------------------------------------------------------------

    #[test]
    fn iterate_filters_by_type() {
        let store = InMemoryObjectStore::new();
        store.put(&make_blob(b"one")).unwrap();
        store.put(&make_blob(b"two")).unwrap();
        store.put(&make_commit("c")).unwrap();

        let blobs: Vec<_> = store
            .iterate(ObjectType::Blob)
            .unwrap()
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(blobs.len(), 2);
        assert_eq!(store.iterate(ObjectType::Any).unwrap().count(), 3);
        assert_eq!(store.iterate(ObjectType::Tag).unwrap().count(), 0);
    }

    #[test]
    fn find_prefix_matches_leading_bytes() {
        let store = InMemoryObjectStore::new();
        let hash = store.put(&make_blob(b"hello world")).unwrap();
        store.put(&make_blob(b"other")).unwrap();

        assert_eq!(store.find_prefix(&[0x95, 0xd0]).unwrap(), vec![hash]);
        assert_eq!(store.find_prefix(&[]).unwrap().len(), 2);
        assert_eq!(store.all_hashes().len(), 2);
    }

    #[test]
    fn batch_operations() {
        let store = InMemoryObjectStore::new();
        let objects = vec![make_blob(b"batch-1"), make_blob(b"batch-2"), make_blob(b"batch-3")];
        let hashes = store.put_batch(&objects).unwrap();
        assert_eq!(store.total_bytes(), 21);
        assert_eq!(store.get_batch(&hashes).unwrap(), objects);
    }

    // -----------------------------------------------------------------------
    // Concurrent read safety
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_reads_are_safe() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(InMemoryObjectStore::new());
        let hash = store.put(&make_blob(b"shared data")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let obj = store.get(&hash, ObjectType::Blob).unwrap();
                    assert!(obj.verify());
                })
            })
            .collect();

        for h in handles {
            h.join().expect("thread should not panic");
        }
    }

    #[test]
    fn debug_format() {
        let store = InMemoryObjectStore::default();
        store.put(&make_blob(b"x")).unwrap();
        let debug = format!("{store:?}");
        assert!(debug.contains("InMemoryObjectStore"));
        assert!(debug.contains("object_count: 1"));
    }
}
