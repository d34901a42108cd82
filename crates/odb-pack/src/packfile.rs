use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

use odb_index::PackIndex;
use odb_types::ObjectHash;

use crate::delta::delta_sizes;
use crate::error::{PackError, PackResult};
use crate::header::ObjectHeader;
use crate::scanner::Scanner;

/// Random access into one pack through its index.
///
/// Returns entries as stored: full objects inflated, deltas as raw delta
/// bodies with their base reference in the header. Chain resolution is the
/// caller's job.
pub struct Packfile<R = File> {
    scanner: Scanner<R>,
    index: Arc<PackIndex>,
}

impl Packfile<File> {
    pub fn open(path: &Path, index: Arc<PackIndex>) -> PackResult<Self> {
        let file = File::open(path)?;
        Ok(Self::new(file, index))
    }
}

impl<R: Read + Seek> Packfile<R> {
    pub fn new(reader: R, index: Arc<PackIndex>) -> Self {
        let format = index.factory().format();
        Self {
            scanner: Scanner::new(reader, format),
            index,
        }
    }

    pub fn index(&self) -> &Arc<PackIndex> {
        &self.index
    }

    /// Checksum of this pack, from its index.
    pub fn checksum(&self) -> ObjectHash {
        self.index.pack_checksum()
    }

    pub fn contains(&self, hash: &ObjectHash) -> bool {
        self.index.contains(hash)
    }

    pub fn find_offset(&self, hash: &ObjectHash) -> Option<u64> {
        self.index.find_offset(hash)
    }

    pub fn find_hash(&self, offset: u64) -> Option<ObjectHash> {
        self.index.find_hash(offset)
    }

    /// Header of the entry at `offset`.
    pub fn object_header(&mut self, offset: u64) -> PackResult<ObjectHeader> {
        self.scanner.seek_object_header(offset)
    }

    /// Header and inflated body of the entry at `offset`.
    pub fn read_raw(&mut self, offset: u64) -> PackResult<(ObjectHeader, Vec<u8>)> {
        let header = self.scanner.seek_object_header(offset)?;
        let mut body = Vec::with_capacity((header.length as usize).min(1 << 20));
        self.scanner.next_object(&mut body)?;
        Ok((header, body))
    }

    /// Header and body of the object named `hash`.
    pub fn read_raw_by_hash(&mut self, hash: &ObjectHash) -> PackResult<(ObjectHeader, Vec<u8>)> {
        let offset = self
            .find_offset(hash)
            .ok_or(PackError::ObjectNotFound(*hash))?;
        self.read_raw(offset)
    }

    /// Size of the object stored at `offset` once materialized. For deltas
    /// this reads only the front of the delta body.
    pub fn size_at(&mut self, offset: u64) -> PackResult<u64> {
        let header = self.scanner.seek_object_header(offset)?;
        if !header.is_delta() {
            return Ok(header.length);
        }
        // Two varints of at most ten bytes each.
        let prefix = self.scanner.next_object_prefix(20)?;
        let (_, target) = delta_sizes(&prefix)?;
        Ok(target)
    }

    /// Release the underlying reader.
    pub fn close(self) -> R {
        self.scanner.into_inner()
    }
}
