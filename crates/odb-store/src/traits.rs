use odb_types::{EncodedObject, ObjectHash, ObjectType};

use crate::error::{StoreError, StoreResult};

/// Lazy sequence of objects produced by [`ObjectStorer::iterate`].
pub type ObjectIter<'a> = Box<dyn Iterator<Item = StoreResult<EncodedObject>> + 'a>;

/// Content-addressed object store.
///
/// All implementations must satisfy these invariants:
/// - Objects are immutable once written; the same content always has the
///   same hash.
/// - Only full objects are written. Delta entries exist inside packs only.
/// - Read paths exhaust every source they know before reporting
///   [`StoreError::NotFound`].
/// - Concurrent reads are always safe.
pub trait ObjectStorer: Send + Sync {
    /// Read an object. `wanted` may be [`ObjectType::Any`].
    ///
    /// Returns [`StoreError::NotFound`] when no source holds the hash and
    /// [`StoreError::TypeMismatch`] when it is stored under another type.
    fn get(&self, hash: &ObjectHash, wanted: ObjectType) -> StoreResult<EncodedObject>;

    /// Check whether an object exists without materializing it.
    fn has(&self, hash: &ObjectHash) -> StoreResult<bool>;

    /// Inflated size of an object.
    fn size(&self, hash: &ObjectHash) -> StoreResult<u64>;

    /// Write an object and return its hash. Writing an existing object is
    /// a no-op.
    fn put(&self, object: &EncodedObject) -> StoreResult<ObjectHash>;

    /// Every object of type `wanted`, each hash once.
    fn iterate(&self, wanted: ObjectType) -> StoreResult<ObjectIter<'_>>;

    /// Every known hash starting with the raw bytes `prefix`, sorted.
    fn find_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<ObjectHash>>;

    /// Read several objects. Default implementation calls `get()` for each.
    fn get_batch(&self, hashes: &[ObjectHash]) -> StoreResult<Vec<EncodedObject>> {
        hashes.iter().map(|h| self.get(h, ObjectType::Any)).collect()
    }

    /// Write several objects. Default implementation calls `put()` for each.
    fn put_batch(&self, objects: &[EncodedObject]) -> StoreResult<Vec<ObjectHash>> {
        objects.iter().map(|o| self.put(o)).collect()
    }
}

/// Check a found object against the wanted type.
pub(crate) fn check_type(object: EncodedObject, wanted: ObjectType) -> StoreResult<EncodedObject> {
    if object.object_type().matches(wanted) {
        Ok(object)
    } else {
        Err(StoreError::TypeMismatch {
            hash: object.hash(),
            expected: wanted,
            actual: object.object_type(),
        })
    }
}
