use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use memmap2::Mmap;
use odb_index::{IndexDecoder, IndexError, OffsetEntryIter, PackIndex};
use odb_pack::{apply_delta, delta_sizes, PackEncoder, PackError, Packfile, WindowSelector};
use odb_types::{hash_object, EncodedObject, ObjectHash, ObjectType, SharedFactory};
use tracing::{debug, warn};

use crate::buffer_pool::BufferPool;
use crate::cache::{ObjectCache, ObjectLru};
use crate::descriptors::{DescriptorPool, DescriptorState, PackHandle};
use crate::error::{IoResultExt, StoreError, StoreResult};
use crate::loose::{LooseReader, LooseWriter};
use crate::objects_dir::ObjectsDir;
use crate::options::{LookupOrder, StoreOptions};
use crate::pack_writer::PackWriter;
use crate::traits::{check_type, ObjectIter, ObjectStorer};

type PackSet = BTreeMap<ObjectHash, Arc<PackIndex>>;

/// Where the walk down a delta chain stopped inside one pack.
enum ChainStart {
    Object(EncodedObject),
    /// A hash-delta base that the pack does not hold.
    Elsewhere(ObjectHash),
}

/// A known pack: its checksum and its index.
#[derive(Clone)]
struct PackRef {
    checksum: ObjectHash,
    index: Arc<PackIndex>,
}

/// A pack entry as stored: either a full object or a delta that still
/// needs its base.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoredObject {
    Full(EncodedObject),
    Delta(DeltaObject),
}

impl StoredObject {
    pub fn hash(&self) -> ObjectHash {
        match self {
            Self::Full(object) => object.hash(),
            Self::Delta(delta) => delta.hash,
        }
    }
}

/// An unresolved packed delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaObject {
    /// Hash of the object the delta produces.
    pub hash: ObjectHash,
    /// [`ObjectType::OfsDelta`] or [`ObjectType::RefDelta`].
    pub delta_type: ObjectType,
    pub base: ObjectHash,
    pub delta: Vec<u8>,
    /// Size of the object once the delta is applied.
    pub actual_size: u64,
}

/// Filesystem object store over one objects directory.
///
/// Objects are looked up as loose files and in every pack under
/// `objects/pack` (in the order set by [`LookupOrder`]), then in the
/// objects directories listed in `objects/info/alternates`. Packs are
/// discovered once, on first use; [`reindex`](Self::reindex) forgets them.
///
/// Deltas are resolved here: a chain is followed to its first full ancestor
/// and patched forward. Hash-named bases outside the pack go through the
/// whole lookup chain. Resolved objects and intermediate bases land in the
/// content cache.
pub struct ObjectStorage {
    dir: ObjectsDir,
    options: StoreOptions,
    factory: SharedFactory,
    cache: Arc<dyn ObjectCache>,
    packs: Arc<RwLock<Option<PackSet>>>,
    descriptors: Mutex<DescriptorPool>,
    buffers: Arc<BufferPool>,
    /// How many alternates links led to this store.
    depth: usize,
}

impl ObjectStorage {
    /// Open the objects directory at `root`. Nothing is read until the
    /// first request.
    pub fn open(root: impl Into<PathBuf>, options: StoreOptions) -> Self {
        let cache = Arc::new(ObjectLru::new(options.cache_capacity));
        Self::with_cache(root, options, cache)
    }

    /// Like [`open`](Self::open), with a caller-supplied content cache.
    pub fn with_cache(root: impl Into<PathBuf>, options: StoreOptions, cache: Arc<dyn ObjectCache>) -> Self {
        Self {
            dir: ObjectsDir::new(root),
            factory: options.factory(),
            descriptors: Mutex::new(DescriptorPool::new(options.descriptor_mode())),
            options,
            cache,
            packs: Arc::new(RwLock::new(None)),
            buffers: BufferPool::new(32 * 1024, 8),
            depth: 0,
        }
    }

    pub fn dir(&self) -> &ObjectsDir {
        &self.dir
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn factory(&self) -> &SharedFactory {
        &self.factory
    }

    // -----------------------------------------------------------------------
    // Pack discovery
    // -----------------------------------------------------------------------

    /// Load the index of every pack on disk. Does nothing once packs are
    /// known; new packs written through [`pack_writer`](Self::pack_writer)
    /// are registered as they are persisted.
    pub fn require_index(&self) -> StoreResult<()> {
        if self.packs.read().expect("lock poisoned").is_some() {
            return Ok(());
        }
        let mut packs = self.packs.write().expect("lock poisoned");
        if packs.is_some() {
            return Ok(());
        }

        let mut set = PackSet::new();
        for checksum in self.dir.pack_checksums(self.factory.format())? {
            match self.load_index(&checksum) {
                Ok(index) => {
                    debug!(pack = %checksum, objects = index.count(), "registered pack");
                    set.insert(checksum, Arc::new(index));
                }
                Err(e) => warn!(pack = %checksum, error = %e, "skipping unreadable pack"),
            }
        }
        *packs = Some(set);
        Ok(())
    }

    /// Forget every known pack and close their descriptors. The next
    /// request rescans `objects/pack`.
    pub fn reindex(&self) {
        *self.packs.write().expect("lock poisoned") = None;
        self.descriptors.lock().expect("lock poisoned").close_all();
    }

    fn load_index(&self, checksum: &ObjectHash) -> StoreResult<PackIndex> {
        let path = self.dir.index_path(checksum);
        let file = File::open(&path).with_path("open pack index", &path)?;
        // SAFETY: index files are only ever replaced by rename, never
        // rewritten in place.
        let map = unsafe { Mmap::map(&file) }.with_path("map pack index", &path)?;
        let index = IndexDecoder::new(&map[..], self.factory.clone()).decode()?;
        if index.pack_checksum() != *checksum {
            return Err(IndexError::Corrupted(format!(
                "index names pack {}, file is named after {checksum}",
                index.pack_checksum()
            ))
            .into());
        }
        Ok(index)
    }

    fn pack_list(&self) -> StoreResult<Vec<PackRef>> {
        self.require_index()?;
        let packs = self.packs.read().expect("lock poisoned");
        Ok(packs
            .iter()
            .flatten()
            .map(|(checksum, index)| PackRef {
                checksum: *checksum,
                index: Arc::clone(index),
            })
            .collect())
    }

    fn find_packed(&self, hash: &ObjectHash) -> StoreResult<Option<(PackRef, u64)>> {
        Ok(self
            .pack_list()?
            .into_iter()
            .find_map(|pack| pack.index.find_offset(hash).map(|offset| (pack, offset))))
    }

    /// Index of the pack named `checksum`.
    pub fn pack_index(&self, checksum: &ObjectHash) -> StoreResult<Option<Arc<PackIndex>>> {
        self.require_index()?;
        let packs = self.packs.read().expect("lock poisoned");
        Ok(packs.as_ref().and_then(|set| set.get(checksum).cloned()))
    }

    /// Checksums of the packs on disk.
    pub fn object_packs(&self) -> StoreResult<Vec<ObjectHash>> {
        self.dir.pack_checksums(self.factory.format())
    }

    // -----------------------------------------------------------------------
    // Descriptors
    // -----------------------------------------------------------------------

    fn with_pack<T>(
        &self,
        pack: &PackRef,
        f: impl FnOnce(&mut Packfile) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let handle = {
            let mut pool = self.descriptors.lock().expect("lock poisoned");
            let path = self.dir.pack_path(&pack.checksum);
            let index = Arc::clone(&pack.index);
            let handle = pool.acquire(pack.checksum, move || {
                let file = File::open(&path).with_path("open pack", &path)?;
                Ok(Packfile::new(file, index))
            })?;
            if matches!(handle, PackHandle::Untracked(_)) {
                pool.mark_untracked(pack.checksum, true);
            }
            handle
        };
        let untracked = matches!(handle, PackHandle::Untracked(_));
        let result = handle.with(f);
        if untracked {
            self.descriptors
                .lock()
                .expect("lock poisoned")
                .mark_untracked(pack.checksum, false);
        }
        result
    }

    pub fn descriptor_state(&self, checksum: &ObjectHash) -> DescriptorState {
        self.descriptors.lock().expect("lock poisoned").state(checksum)
    }

    /// Close every open pack descriptor. Known packs stay known.
    pub fn close(&self) {
        self.descriptors.lock().expect("lock poisoned").close_all();
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn remember(&self, object: &EncodedObject) {
        if self.options.is_cacheable(object.size()) {
            self.cache.put(object.clone());
        }
    }

    fn get_local(&self, hash: &ObjectHash) -> StoreResult<Option<EncodedObject>> {
        match self.options.lookup_order {
            LookupOrder::LooseFirst => match self.get_loose(hash)? {
                Some(object) => Ok(Some(object)),
                None => self.get_packed(hash),
            },
            LookupOrder::PackedFirst => match self.get_packed(hash)? {
                Some(object) => Ok(Some(object)),
                None => self.get_loose(hash),
            },
        }
    }

    fn get_loose(&self, hash: &ObjectHash) -> StoreResult<Option<EncodedObject>> {
        let path = self.dir.loose_path(hash);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_path("open loose object", path),
        };
        if let Some(object) = self.cache.get(hash) {
            return Ok(Some(object));
        }

        let reader = LooseReader::new(BufReader::new(file)).map_err(|e| loose_error(hash, &path, e))?;
        let object_type = reader.object_type();
        let mut scratch = self.buffers.get();
        let body = reader
            .read_body(&mut scratch)
            .map_err(|e| loose_error(hash, &path, e))?;
        let object = EncodedObject::with_hash(*hash, object_type, body);
        self.remember(&object);
        Ok(Some(object))
    }

    fn get_packed(&self, hash: &ObjectHash) -> StoreResult<Option<EncodedObject>> {
        let Some((pack, offset)) = self.find_packed(hash)? else {
            return Ok(None);
        };
        self.packed_object(&pack, offset, *hash).map(Some)
    }

    fn packed_object(&self, pack: &PackRef, offset: u64, hash: ObjectHash) -> StoreResult<EncodedObject> {
        if let Some(object) = self.cache.get(&hash) {
            return Ok(object);
        }
        self.read_packed(pack, offset, hash, &mut HashSet::new())
    }

    /// Materialize the entry at `offset`, following its delta chain.
    /// `visited` spans the whole resolution, across packs.
    fn read_packed(
        &self,
        pack: &PackRef,
        offset: u64,
        hash: ObjectHash,
        visited: &mut HashSet<(ObjectHash, u64)>,
    ) -> StoreResult<EncodedObject> {
        let corrupt = |reason: String| StoreError::CorruptObject { hash, reason };

        // Deltas met inside this pack, target first.
        let mut chain: Vec<(u64, Vec<u8>)> = Vec::new();
        let start = self.with_pack(pack, |file| {
            let mut current = offset;
            loop {
                if !visited.insert((pack.checksum, current)) {
                    return Err(corrupt(format!("delta chain loops back to offset {current}")));
                }
                let step_hash = pack.index.find_hash(current);
                if let Some(cached) = step_hash.and_then(|h| self.cache.get(&h)) {
                    return Ok(ChainStart::Object(cached));
                }

                let (header, body) = file.read_raw(current)?;
                match header.object_type {
                    ObjectType::OfsDelta => {
                        let base_offset = header
                            .offset_reference
                            .ok_or_else(|| corrupt("offset delta without base offset".into()))?;
                        chain.push((current, body));
                        current = base_offset;
                    }
                    ObjectType::RefDelta => {
                        let base_hash = header
                            .reference
                            .ok_or_else(|| corrupt("hash delta without base hash".into()))?;
                        chain.push((current, body));
                        match pack.index.find_offset(&base_hash) {
                            Some(base_offset) => current = base_offset,
                            None => return Ok(ChainStart::Elsewhere(base_hash)),
                        }
                    }
                    object_type => {
                        let step_hash = step_hash
                            .unwrap_or_else(|| hash_object(self.factory.format(), object_type, &body));
                        let object = EncodedObject::with_hash(step_hash, object_type, body);
                        self.remember(&object);
                        return Ok(ChainStart::Object(object));
                    }
                }
            }
        })?;
        let base = match start {
            ChainStart::Object(object) => object,
            ChainStart::Elsewhere(base_hash) => self.resolve_base(&base_hash, hash, visited)?,
        };

        let object_type = base.object_type();
        let mut object = base;
        for (step_offset, delta) in chain.into_iter().rev() {
            let data = apply_delta(object.data(), &delta).map_err(|e| corrupt(e.to_string()))?;
            let step_hash = pack
                .index
                .find_hash(step_offset)
                .unwrap_or_else(|| hash_object(self.factory.format(), object_type, &data));
            object = EncodedObject::with_hash(step_hash, object_type, data);
            self.remember(&object);
        }
        Ok(object)
    }

    /// A hash-delta base that is not in the delta's own pack.
    fn resolve_base(
        &self,
        base: &ObjectHash,
        target: ObjectHash,
        visited: &mut HashSet<(ObjectHash, u64)>,
    ) -> StoreResult<EncodedObject> {
        if let Some(object) = self.get_loose(base)? {
            return Ok(object);
        }
        if let Some((pack, offset)) = self.find_packed(base)? {
            return self.read_packed(&pack, offset, *base, visited);
        }
        if let Some(object) = self.get_from_alternates(base)? {
            return Ok(object);
        }
        Err(StoreError::CorruptObject {
            hash: target,
            reason: format!("delta base {base} not found"),
        })
    }

    /// Stores for the directories in `objects/info/alternates`.
    fn alternates(&self) -> Vec<ObjectStorage> {
        let paths = match self.dir.alternates() {
            Ok(paths) => paths,
            Err(e) => {
                warn!(dir = %self.dir.root().display(), error = %e, "ignoring unreadable alternates");
                return Vec::new();
            }
        };
        if paths.is_empty() {
            return Vec::new();
        }
        if self.depth >= self.options.max_alternate_depth {
            warn!(dir = %self.dir.root().display(), depth = self.depth, "alternates nested too deep");
            return Vec::new();
        }
        paths
            .into_iter()
            .map(|root| ObjectStorage {
                dir: ObjectsDir::new(root),
                options: self.options.clone(),
                factory: self.factory.clone(),
                cache: Arc::clone(&self.cache),
                packs: Arc::new(RwLock::new(None)),
                descriptors: Mutex::new(DescriptorPool::new(self.options.descriptor_mode())),
                buffers: Arc::clone(&self.buffers),
                depth: self.depth + 1,
            })
            .collect()
    }

    fn get_from_alternates(&self, hash: &ObjectHash) -> StoreResult<Option<EncodedObject>> {
        for alternate in self.alternates() {
            let found = alternate.get_local(hash).and_then(|local| match local {
                Some(object) => Ok(Some(object)),
                None => alternate.get_from_alternates(hash),
            });
            match found {
                Ok(Some(object)) => return Ok(Some(object)),
                Ok(None) => {}
                Err(e) => {
                    warn!(dir = %alternate.dir.root().display(), %hash, error = %e, "alternate lookup failed")
                }
            }
        }
        Ok(None)
    }

    /// Read an object, trying loose files and packs, then alternates.
    pub fn get(&self, hash: &ObjectHash, wanted: ObjectType) -> StoreResult<EncodedObject> {
        let object = match self.get_local(hash)? {
            Some(object) => object,
            None => self
                .get_from_alternates(hash)?
                .ok_or(StoreError::NotFound(*hash))?,
        };
        check_type(object, wanted)
    }

    /// Read an object without resolving it if it is a packed delta.
    /// Alternates are not consulted.
    pub fn delta_object(&self, hash: &ObjectHash, wanted: ObjectType) -> StoreResult<StoredObject> {
        if let Some(object) = self.get_loose(hash)? {
            return check_type(object, wanted).map(StoredObject::Full);
        }
        let (pack, offset) = self.find_packed(hash)?.ok_or(StoreError::NotFound(*hash))?;
        let (header, body) = self.with_pack(&pack, |p| Ok(p.read_raw(offset)?))?;

        let base = match header.object_type {
            ObjectType::OfsDelta => header
                .offset_reference
                .and_then(|base_offset| pack.index.find_hash(base_offset)),
            ObjectType::RefDelta => header.reference,
            object_type => {
                let object = EncodedObject::with_hash(*hash, object_type, body);
                return check_type(object, wanted).map(StoredObject::Full);
            }
        };
        if !header.object_type.matches(wanted) {
            return Err(StoreError::TypeMismatch {
                hash: *hash,
                expected: wanted,
                actual: header.object_type,
            });
        }
        let base = base.ok_or_else(|| StoreError::CorruptObject {
            hash: *hash,
            reason: "delta base is not an indexed object".into(),
        })?;
        let (_, actual_size) = delta_sizes(&body)?;
        Ok(StoredObject::Delta(DeltaObject {
            hash: *hash,
            delta_type: header.object_type,
            base,
            delta: body,
            actual_size,
        }))
    }

    pub fn has(&self, hash: &ObjectHash) -> StoreResult<bool> {
        if self.dir.loose_path(hash).is_file() || self.find_packed(hash)?.is_some() {
            return Ok(true);
        }
        for alternate in self.alternates() {
            match alternate.has(hash) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    warn!(dir = %alternate.dir.root().display(), %hash, error = %e, "alternate lookup failed")
                }
            }
        }
        Ok(false)
    }

    /// Inflated size. Loose objects only have their header inflated;
    /// packed deltas only the front of the delta.
    pub fn size(&self, hash: &ObjectHash) -> StoreResult<u64> {
        if let Some(object) = self.cache.get(hash) {
            return Ok(object.size());
        }
        let path = self.dir.loose_path(hash);
        match File::open(&path) {
            Ok(file) => {
                let reader =
                    LooseReader::new(BufReader::new(file)).map_err(|e| loose_error(hash, &path, e))?;
                return Ok(reader.size());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_path("open loose object", path),
        }
        if let Some((pack, offset)) = self.find_packed(hash)? {
            return self.with_pack(&pack, |p| Ok(p.size_at(offset)?));
        }
        for alternate in self.alternates() {
            match alternate.size(hash) {
                Ok(size) => return Ok(size),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::NotFound(*hash))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Write a full object as a loose file.
    pub fn put(&self, object: &EncodedObject) -> StoreResult<ObjectHash> {
        let object_type = object.object_type();
        if !object_type.is_full() {
            return Err(StoreError::InvalidType(object_type));
        }
        if object.hash().format() == self.factory.format()
            && self.dir.loose_path(&object.hash()).is_file()
        {
            return Ok(object.hash());
        }
        let mut writer = self.loose_writer(object_type, object.size())?;
        writer
            .write_all(object.data())
            .with_path("write loose object", self.dir.root())?;
        writer.finish()
    }

    /// A writer for one loose object whose size is known up front.
    pub fn loose_writer(&self, object_type: ObjectType, size: u64) -> StoreResult<LooseWriter> {
        if !object_type.is_full() {
            return Err(StoreError::InvalidType(object_type));
        }
        LooseWriter::new(&self.dir, self.factory.format(), object_type, size)
    }

    /// A sink for a raw pack. The pack is registered with this store once
    /// the writer is closed.
    pub fn pack_writer(&self) -> StoreResult<PackWriter> {
        let packs = Arc::clone(&self.packs);
        Ok(PackWriter::new(&self.dir, self.factory.clone())?.with_notify(move |checksum, index| {
            if let Some(set) = packs.write().expect("lock poisoned").as_mut() {
                set.insert(checksum, index);
            }
        }))
    }

    /// Write a pack holding `hashes` to `writer`, trying each object as a
    /// delta against the previous `window` objects. Returns the pack
    /// checksum.
    pub fn encode_pack<W: Write>(&self, hashes: &[ObjectHash], window: usize, writer: W) -> StoreResult<ObjectHash> {
        let selector = WindowSelector::new(|hash: &ObjectHash| {
            self.get(hash, ObjectType::Any).map_err(|e| match e {
                StoreError::NotFound(hash) => PackError::ObjectNotFound(hash),
                StoreError::Pack(e) => e,
                other => PackError::Io(io::Error::other(other.to_string())),
            })
        });
        let mut encoder = PackEncoder::new(writer, self.factory.format());
        Ok(encoder.encode(hashes, window, &selector)?)
    }

    // -----------------------------------------------------------------------
    // Enumeration and maintenance
    // -----------------------------------------------------------------------

    /// Every object of type `wanted`: loose objects first, then each pack
    /// in offset order. A hash is yielded once; loose copies shadow packed
    /// ones.
    pub fn iterate(&self, wanted: ObjectType) -> StoreResult<ObjectIter<'_>> {
        let loose = self.dir.loose_hashes(self.factory.format())?;
        let packs = self.pack_list()?;
        Ok(Box::new(StorageIter {
            store: self,
            wanted,
            loose: loose.into_iter(),
            packs: packs.into_iter(),
            current: None,
            seen: HashSet::new(),
        }))
    }

    /// Every loose or packed hash starting with `prefix`, sorted.
    pub fn find_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<ObjectHash>> {
        let mut found: BTreeSet<ObjectHash> = self
            .dir
            .loose_hashes(self.factory.format())?
            .into_iter()
            .filter(|h| h.has_prefix(prefix))
            .collect();
        for pack in self.pack_list()? {
            found.extend(
                pack.index
                    .entries()
                    .map(|e| e.hash)
                    .filter(|h| h.has_prefix(prefix)),
            );
        }
        Ok(found.into_iter().collect())
    }

    /// Call `f` with every loose object hash until it breaks.
    pub fn for_each_object_hash(&self, mut f: impl FnMut(ObjectHash) -> ControlFlow<()>) -> StoreResult<()> {
        for hash in self.dir.loose_hashes(self.factory.format())? {
            if f(hash).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Modification time of a loose object.
    pub fn loose_object_time(&self, hash: &ObjectHash) -> StoreResult<SystemTime> {
        let path = self.dir.loose_path(hash);
        match fs::metadata(&path) {
            Ok(meta) => meta.modified().with_path("stat loose object", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(*hash)),
            Err(e) => Err(e).with_path("stat loose object", path),
        }
    }

    pub fn delete_loose_object(&self, hash: &ObjectHash) -> StoreResult<()> {
        let path = self.dir.loose_path(hash);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(*hash)),
            Err(e) => Err(e).with_path("delete loose object", path),
        }
    }

    /// Delete a pack and its index, unless the pack was modified at or
    /// after `older_than`. Returns whether the pair was deleted. The index
    /// is removed first.
    pub fn delete_old_object_pack_and_index(
        &self,
        checksum: &ObjectHash,
        older_than: Option<SystemTime>,
    ) -> StoreResult<bool> {
        let pack_path = self.dir.pack_path(checksum);
        if let Some(cutoff) = older_than {
            let modified = match fs::metadata(&pack_path) {
                Ok(meta) => meta.modified().with_path("stat pack", &pack_path)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(StoreError::NotFound(*checksum))
                }
                Err(e) => return Err(e).with_path("stat pack", pack_path),
            };
            if modified >= cutoff {
                return Ok(false);
            }
        }

        if let Some(set) = self.packs.write().expect("lock poisoned").as_mut() {
            set.remove(checksum);
        }
        self.descriptors.lock().expect("lock poisoned").forget(checksum);

        let idx_path = self.dir.index_path(checksum);
        match fs::remove_file(&idx_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_path("delete pack index", idx_path),
        }
        match fs::remove_file(&pack_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound(*checksum)),
            Err(e) => return Err(e).with_path("delete pack", pack_path),
        }
        debug!(pack = %checksum, "deleted pack");
        Ok(true)
    }
}

fn loose_error(hash: &ObjectHash, path: &std::path::Path, e: io::Error) -> StoreError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            StoreError::CorruptObject {
                hash: *hash,
                reason: e.to_string(),
            }
        }
        _ => StoreError::Io {
            op: "read loose object",
            path: path.to_path_buf(),
            source: e,
        },
    }
}

impl ObjectStorer for ObjectStorage {
    fn get(&self, hash: &ObjectHash, wanted: ObjectType) -> StoreResult<EncodedObject> {
        ObjectStorage::get(self, hash, wanted)
    }

    fn has(&self, hash: &ObjectHash) -> StoreResult<bool> {
        ObjectStorage::has(self, hash)
    }

    fn size(&self, hash: &ObjectHash) -> StoreResult<u64> {
        ObjectStorage::size(self, hash)
    }

    fn put(&self, object: &EncodedObject) -> StoreResult<ObjectHash> {
        ObjectStorage::put(self, object)
    }

    fn iterate(&self, wanted: ObjectType) -> StoreResult<ObjectIter<'_>> {
        ObjectStorage::iterate(self, wanted)
    }

    fn find_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<ObjectHash>> {
        ObjectStorage::find_prefix(self, prefix)
    }
}

impl std::fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let packs = self
            .packs
            .read()
            .expect("lock poisoned")
            .as_ref()
            .map(|set| set.len());
        let pool = self.descriptors.lock().expect("lock poisoned");
        f.debug_struct("ObjectStorage")
            .field("dir", &self.dir.root())
            .field("format", &self.factory.format())
            .field("packs", &packs)
            .field("descriptors", &pool.mode())
            .field("open_packs", &pool.open_count())
            .field("packs_opened", &pool.opened())
            .finish()
    }
}

/// Lazy walk over loose objects, then pack by pack.
struct StorageIter<'a> {
    store: &'a ObjectStorage,
    wanted: ObjectType,
    loose: std::vec::IntoIter<ObjectHash>,
    packs: std::vec::IntoIter<PackRef>,
    current: Option<(PackRef, OffsetEntryIter)>,
    seen: HashSet<ObjectHash>,
}

impl Iterator for StorageIter<'_> {
    type Item = StoreResult<EncodedObject>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(hash) = self.loose.next() {
                self.seen.insert(hash);
                match self.store.get_loose(&hash) {
                    Ok(Some(object)) if object.object_type().matches(self.wanted) => {
                        return Some(Ok(object))
                    }
                    // Filtered out, or deleted since the listing.
                    Ok(_) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }

            if let Some((pack, entries)) = self.current.as_mut() {
                if let Some(entry) = entries.next() {
                    if !self.seen.insert(entry.hash) {
                        continue;
                    }
                    match self.store.packed_object(pack, entry.offset, entry.hash) {
                        Ok(object) if object.object_type().matches(self.wanted) => {
                            return Some(Ok(object))
                        }
                        Ok(_) => continue,
                        Err(e) => return Some(Err(e)),
                    }
                }
            }

            let pack = self.packs.next()?;
            let entries = pack.index.entries_by_offset();
            self.current = Some((pack, entries));
        }
    }
}
