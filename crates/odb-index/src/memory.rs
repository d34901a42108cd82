use std::collections::HashMap;
use std::fmt;
use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use odb_types::{ObjectFormat, ObjectHash, SharedFactory};

use crate::entry::{Entry, EntryIter, OffsetEntryIter};
use crate::error::{IndexError, IndexResult};

/// Number of fan-out buckets (one per leading digest byte).
pub const FANOUT: usize = 256;

/// Offsets with this bit set in the 32-bit table index into the 64-bit table.
pub(crate) const IS_O64_MASK: u32 = 1 << 31;

/// On-disk index version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Version {
    /// Headerless legacy layout: interleaved (offset, name) records, no CRCs.
    V1,
    #[default]
    V2,
    /// Same layout as v2, tagged with version 3.
    V3,
}

impl Version {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }
}

/// Per-bucket tables. Names are packed back to back so the bisection
/// touches one contiguous buffer.
#[derive(Clone, Debug, Default)]
pub(crate) struct Bucket {
    pub names: Vec<u8>,
    pub offset32: Vec<u8>,
    pub crc32: Vec<u8>,
}

impl Bucket {
    pub fn len(&self) -> usize {
        self.offset32.len() / 4
    }

    pub fn crc32_at(&self, pos: usize) -> u32 {
        read_u32(&self.crc32[pos * 4..])
    }

    pub fn name_at(&self, pos: usize, size: usize) -> &[u8] {
        &self.names[pos * size..(pos + 1) * size]
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Tables {
    pub version: Version,
    pub fanout: [u32; FANOUT],
    pub buckets: Vec<Bucket>,
    pub offset64: Vec<u8>,
    pub pack_checksum: ObjectHash,
    pub idx_checksum: ObjectHash,
    /// False while a streaming build has not reached the pack footer.
    pub complete: bool,
}

impl Tables {
    pub fn empty(format: ObjectFormat) -> Self {
        Self {
            version: Version::V2,
            fanout: [0; FANOUT],
            buckets: vec![Bucket::default(); FANOUT],
            offset64: Vec::new(),
            pack_checksum: ObjectHash::zero(format),
            idx_checksum: ObjectHash::zero(format),
            complete: false,
        }
    }

    /// Build complete v2 tables from entries in any order.
    pub fn from_entries(
        format: ObjectFormat,
        mut entries: Vec<Entry>,
        pack_checksum: ObjectHash,
    ) -> Self {
        entries.sort_by(|a, b| a.hash.cmp(&b.hash));
        entries.dedup_by(|a, b| a.hash == b.hash);

        let mut tables = Self::empty(format);
        let mut large = 0u32;
        for entry in &entries {
            let first = entry.hash.as_bytes()[0] as usize;
            let bucket = &mut tables.buckets[first];
            bucket.names.extend_from_slice(entry.hash.as_bytes());
            bucket.crc32.extend_from_slice(&entry.crc32.to_be_bytes());
            if entry.offset > (IS_O64_MASK - 1) as u64 {
                bucket
                    .offset32
                    .extend_from_slice(&(large | IS_O64_MASK).to_be_bytes());
                tables.offset64.extend_from_slice(&entry.offset.to_be_bytes());
                large += 1;
            } else {
                bucket
                    .offset32
                    .extend_from_slice(&(entry.offset as u32).to_be_bytes());
            }
            tables.fanout[first] += 1;
        }
        for i in 1..FANOUT {
            tables.fanout[i] += tables.fanout[i - 1];
        }
        tables.pack_checksum = pack_checksum;
        tables.complete = true;
        tables
    }

    pub fn offset_at(&self, bucket: usize, pos: usize) -> u64 {
        let raw = read_u32(&self.buckets[bucket].offset32[pos * 4..]);
        if raw & IS_O64_MASK != 0 {
            let at = 8 * (raw & !IS_O64_MASK) as usize;
            read_u64(&self.offset64[at..])
        } else {
            raw as u64
        }
    }

    pub fn count(&self) -> u64 {
        self.fanout[FANOUT - 1] as u64
    }
}

pub(crate) fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub(crate) fn read_u64(b: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&b[..8]);
    u64::from_be_bytes(arr)
}

/// In-memory directory of one pack: hash ↔ (offset, CRC32).
///
/// Entries are split into 256 buckets by the first digest byte, and each
/// bucket is sorted so lookups are a fan-out jump plus a bisection. Readers
/// share the tables; a streaming build and the encoder take them
/// exclusively, and the encoder refuses to wait for a build.
///
/// The reverse offset → hash map is built on the first [`find_hash`] call
/// and kept for the lifetime of the index.
///
/// [`find_hash`]: PackIndex::find_hash
pub struct PackIndex {
    factory: SharedFactory,
    pub(crate) tables: RwLock<Tables>,
    reverse: OnceLock<HashMap<u64, ObjectHash>>,
}

impl PackIndex {
    /// An empty index waiting to be populated by a streaming build.
    pub fn empty(factory: SharedFactory) -> Self {
        let tables = Tables::empty(factory.format());
        Self::from_tables(factory, tables)
    }

    /// A complete index from (hash, crc32, offset) entries.
    pub fn from_entries(
        factory: SharedFactory,
        entries: Vec<Entry>,
        pack_checksum: ObjectHash,
    ) -> Self {
        let tables = Tables::from_entries(factory.format(), entries, pack_checksum);
        Self::from_tables(factory, tables)
    }

    pub(crate) fn from_tables(factory: SharedFactory, tables: Tables) -> Self {
        Self {
            factory,
            tables: RwLock::new(tables),
            reverse: OnceLock::new(),
        }
    }

    pub(crate) fn read_tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().expect("index lock poisoned")
    }

    /// Take the tables exclusively without blocking.
    pub(crate) fn try_exclusive(&self) -> IndexResult<RwLockWriteGuard<'_, Tables>> {
        match self.tables.try_write() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => {
                Err(IndexError::Locked)
            }
        }
    }

    /// Start populating the index. Fails immediately if someone else holds it.
    pub(crate) fn begin_build(&self) -> IndexResult<BuildGuard<'_>> {
        let guard = self.try_exclusive()?;
        if guard.complete {
            return Err(IndexError::Unencodable("index is already built".into()));
        }
        Ok(BuildGuard { guard })
    }

    pub fn factory(&self) -> &SharedFactory {
        &self.factory
    }

    pub fn version(&self) -> Version {
        self.read_tables().version
    }

    /// Whether the index has been fully built.
    pub fn is_complete(&self) -> bool {
        self.read_tables().complete
    }

    /// The fan-out table: cumulative entry counts per leading byte.
    pub fn fanout(&self) -> [u32; FANOUT] {
        self.read_tables().fanout
    }

    /// Checksum of the pack this index describes.
    pub fn pack_checksum(&self) -> ObjectHash {
        self.read_tables().pack_checksum
    }

    /// Checksum of the index file itself, as decoded or last encoded.
    pub fn idx_checksum(&self) -> ObjectHash {
        self.read_tables().idx_checksum
    }

    fn position(&self, tables: &Tables, hash: &ObjectHash) -> Option<(usize, usize)> {
        if hash.format() != self.factory.format() {
            return None;
        }
        let first = hash.as_bytes()[0] as usize;
        let bucket = &tables.buckets[first];
        let size = self.factory.size();

        let mut low = 0usize;
        let mut high = bucket.len();
        while low < high {
            let mid = (low + high) / 2;
            match hash.compare(bucket.name_at(mid, size)) {
                std::cmp::Ordering::Less => high = mid,
                std::cmp::Ordering::Greater => low = mid + 1,
                std::cmp::Ordering::Equal => return Some((first, mid)),
            }
        }
        None
    }

    pub fn contains(&self, hash: &ObjectHash) -> bool {
        let tables = self.read_tables();
        self.position(&tables, hash).is_some()
    }

    /// Pack offset of the object with the given hash.
    pub fn find_offset(&self, hash: &ObjectHash) -> Option<u64> {
        let tables = self.read_tables();
        let (bucket, pos) = self.position(&tables, hash)?;
        Some(tables.offset_at(bucket, pos))
    }

    /// CRC32 of the packed entry with the given hash.
    pub fn find_crc32(&self, hash: &ObjectHash) -> Option<u32> {
        let tables = self.read_tables();
        let (bucket, pos) = self.position(&tables, hash)?;
        Some(tables.buckets[bucket].crc32_at(pos))
    }

    /// Hash of the object stored at `offset`.
    ///
    /// The first call builds the reverse map in one pass over all entries.
    pub fn find_hash(&self, offset: u64) -> Option<ObjectHash> {
        if let Some(reverse) = self.reverse.get() {
            return reverse.get(&offset).copied();
        }
        if !self.is_complete() {
            return None;
        }
        let reverse = self.reverse.get_or_init(|| {
            self.entries()
                .map(|entry| (entry.offset, entry.hash))
                .collect()
        });
        reverse.get(&offset).copied()
    }

    /// Number of entries.
    pub fn count(&self) -> u64 {
        self.read_tables().count()
    }

    /// Entries in hash order. Holds a shared lock until dropped.
    pub fn entries(&self) -> EntryIter<'_> {
        EntryIter::new(self.read_tables(), self.factory.format())
    }

    /// Entries sorted by pack offset, materialized once.
    pub fn entries_by_offset(&self) -> OffsetEntryIter {
        let mut entries: Vec<Entry> = self.entries().collect();
        entries.sort_by_key(|e| e.offset);
        OffsetEntryIter::new(entries)
    }
}

impl fmt::Debug for PackIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tables.try_read() {
            Ok(tables) => f
                .debug_struct("PackIndex")
                .field("format", &self.factory.format())
                .field("version", &tables.version)
                .field("count", &tables.count())
                .field("pack_checksum", &tables.pack_checksum)
                .finish(),
            Err(_) => f.debug_struct("PackIndex").field("locked", &true).finish(),
        }
    }
}

/// Exclusive access to an index under construction.
pub(crate) struct BuildGuard<'a> {
    guard: RwLockWriteGuard<'a, Tables>,
}

impl BuildGuard<'_> {
    pub fn finish(mut self, tables: Tables) {
        *self.guard = tables;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_types::default_factory;

    fn hash(first: u8, second: u8) -> ObjectHash {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        bytes[1] = second;
        ObjectHash::from(bytes)
    }

    fn sample() -> (PackIndex, Vec<Entry>) {
        let entries: Vec<Entry> = (0..40u8)
            .map(|i| Entry {
                hash: hash(i.wrapping_mul(37), i),
                crc32: 1000 + i as u32,
                offset: 12 + i as u64 * 100,
            })
            .collect();
        let idx = PackIndex::from_entries(default_factory(), entries.clone(), hash(0xee, 0xee));
        (idx, entries)
    }

    #[test]
    fn empty_index() {
        let idx = PackIndex::from_entries(default_factory(), vec![], hash(0, 0));
        assert_eq!(idx.count(), 0);
        assert!(idx.fanout().iter().all(|&c| c == 0));
        assert!(!idx.contains(&hash(1, 1)));
        assert_eq!(idx.find_offset(&hash(0, 0)), None);
        assert_eq!(idx.entries().count(), 0);
    }

    #[test]
    fn lookups_are_inverse_consistent() {
        let (idx, entries) = sample();
        assert_eq!(idx.count(), 40);
        for e in &entries {
            assert!(idx.contains(&e.hash));
            assert_eq!(idx.find_offset(&e.hash), Some(e.offset));
            assert_eq!(idx.find_crc32(&e.hash), Some(e.crc32));
            assert_eq!(idx.find_hash(e.offset), Some(e.hash));
        }
    }

    #[test]
    fn missing_hash_in_populated_bucket() {
        let (idx, _) = sample();
        assert!(!idx.contains(&hash(0, 99)));
        assert_eq!(idx.find_crc32(&hash(37, 200)), None);
        assert_eq!(idx.find_hash(13), None);
    }

    #[test]
    fn other_width_is_never_found() {
        let (idx, _) = sample();
        assert!(!idx.contains(&ObjectHash::from([0u8; 32])));
    }

    #[test]
    fn fanout_is_monotonic_and_totals_count() {
        let (idx, _) = sample();
        let fanout = idx.fanout();
        for i in 1..FANOUT {
            assert!(fanout[i] >= fanout[i - 1]);
        }
        assert_eq!(fanout[FANOUT - 1] as u64, idx.count());
    }

    #[test]
    fn large_offsets_use_overflow_table() {
        let entries = vec![
            Entry { hash: hash(1, 0), crc32: 1, offset: 12 },
            Entry { hash: hash(2, 0), crc32: 2, offset: 0x7fff_ffff },
            Entry { hash: hash(3, 0), crc32: 3, offset: 0x8000_0000 },
            Entry { hash: hash(4, 0), crc32: 4, offset: 5_924_278_919 },
        ];
        let idx = PackIndex::from_entries(default_factory(), entries.clone(), hash(9, 9));
        assert_eq!(idx.read_tables().offset64.len(), 16);
        for e in &entries {
            assert_eq!(idx.find_offset(&e.hash), Some(e.offset));
        }
    }

    #[test]
    fn entries_are_hash_ordered() {
        let (idx, _) = sample();
        let hashes: Vec<_> = idx.entries().map(|e| e.hash).collect();
        assert_eq!(hashes.len(), 40);
        assert!(hashes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn entries_by_offset_are_offset_ordered() {
        let (idx, _) = sample();
        let offsets: Vec<_> = idx.entries_by_offset().map(|e| e.offset).collect();
        assert_eq!(offsets.len(), 40);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(offsets[0], 12);
    }

    #[test]
    fn reverse_map_is_built_once() {
        let (idx, entries) = sample();
        assert!(idx.reverse.get().is_none());
        idx.find_hash(entries[3].offset);
        let first = idx.reverse.get().map(|m| m as *const _);
        idx.find_hash(entries[5].offset);
        assert_eq!(idx.reverse.get().map(|m| m as *const _), first);
    }

    #[test]
    fn incomplete_index_has_no_reverse_map() {
        let idx = PackIndex::empty(default_factory());
        assert!(!idx.is_complete());
        assert_eq!(idx.find_hash(12), None);
        assert!(idx.reverse.get().is_none());
    }

    #[test]
    fn begin_build_is_exclusive() {
        let idx = PackIndex::empty(default_factory());
        let guard = idx.begin_build().unwrap();
        assert!(matches!(idx.begin_build(), Err(IndexError::Locked)));
        drop(guard);
        assert!(idx.begin_build().is_ok());
    }

    #[test]
    fn begin_build_rejects_built_index() {
        let (idx, _) = sample();
        assert!(matches!(idx.begin_build(), Err(IndexError::Unencodable(_))));
    }
}
