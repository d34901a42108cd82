use std::sync::RwLockReadGuard;

use odb_types::{ObjectFormat, ObjectHash};

use crate::memory::{Tables, FANOUT};

/// One object in a pack: its hash, the CRC32 of its packed bytes, and
/// where its entry starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Entry {
    pub hash: ObjectHash,
    pub crc32: u32,
    pub offset: u64,
}

/// Entries in hash order, read straight from the bucket tables.
///
/// Holds a shared lock on the index until dropped.
pub struct EntryIter<'a> {
    tables: RwLockReadGuard<'a, Tables>,
    format: ObjectFormat,
    bucket: usize,
    pos: usize,
}

impl<'a> EntryIter<'a> {
    pub(crate) fn new(tables: RwLockReadGuard<'a, Tables>, format: ObjectFormat) -> Self {
        Self {
            tables,
            format,
            bucket: 0,
            pos: 0,
        }
    }
}

impl Iterator for EntryIter<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        while self.bucket < FANOUT {
            let bucket = &self.tables.buckets[self.bucket];
            if self.pos < bucket.len() {
                let size = self.format.size();
                let hash = ObjectHash::from_prefix_of(self.format, bucket.name_at(self.pos, size))?;
                let entry = Entry {
                    hash,
                    crc32: bucket.crc32_at(self.pos),
                    offset: self.tables.offset_at(self.bucket, self.pos),
                };
                self.pos += 1;
                return Some(entry);
            }
            self.bucket += 1;
            self.pos = 0;
        }
        None
    }
}

/// Entries sorted by pack offset.
#[derive(Debug)]
pub struct OffsetEntryIter {
    inner: std::vec::IntoIter<Entry>,
}

impl OffsetEntryIter {
    pub(crate) fn new(entries: Vec<Entry>) -> Self {
        Self {
            inner: entries.into_iter(),
        }
    }
}

impl Iterator for OffsetEntryIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for OffsetEntryIter {}
