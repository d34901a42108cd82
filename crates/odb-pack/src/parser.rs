use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use odb_index::IndexWriter;
use odb_types::{hash_object, Hasher, ObjectFormat, ObjectHash, ObjectType};
use tracing::debug;

use crate::delta::apply_delta;
use crate::error::{PackError, PackResult};
use crate::header::ObjectHeader;
use crate::scanner::Scanner;

/// Receives parse events. Every resolved object is reported exactly once,
/// deltas after the objects they are built on.
pub trait Observer {
    fn on_header(&mut self, count: u32) -> PackResult<()>;

    fn on_inflated_object_header(
        &mut self,
        _object_type: ObjectType,
        _length: u64,
        _offset: u64,
    ) -> PackResult<()> {
        Ok(())
    }

    fn on_inflated_object_content(
        &mut self,
        hash: ObjectHash,
        offset: u64,
        crc32: u32,
        base_offset: Option<u64>,
    ) -> PackResult<()>;

    fn on_footer(&mut self, checksum: ObjectHash) -> PackResult<()>;
}

impl Observer for IndexWriter {
    fn on_header(&mut self, count: u32) -> PackResult<()> {
        Ok(IndexWriter::on_header(self, count)?)
    }

    fn on_inflated_object_content(
        &mut self,
        hash: ObjectHash,
        offset: u64,
        crc32: u32,
        base_offset: Option<u64>,
    ) -> PackResult<()> {
        Ok(IndexWriter::on_inflated_object_content(
            self,
            hash,
            offset,
            crc32,
            base_offset,
        )?)
    }

    fn on_footer(&mut self, checksum: ObjectHash) -> PackResult<()> {
        Ok(IndexWriter::on_footer(self, checksum)?)
    }
}

#[derive(Debug)]
struct ParsedEntry {
    header: ObjectHeader,
    crc32: u32,
    /// Full type; for deltas known once resolved.
    object_type: Option<ObjectType>,
    hash: Option<ObjectHash>,
    /// Deltas still waiting on this entry as their base.
    children: usize,
}

/// Where phase two gets entry bodies from.
enum Bodies {
    /// Every inflated body kept from the first pass, keyed by offset.
    Memory(HashMap<u64, Vec<u8>>),
    /// Bodies re-read on demand from the pack on disk.
    File(Scanner<File>),
}

/// Streaming pack parser.
///
/// The first pass reads the stream once: it hashes every full object,
/// records delta entries and verifies the trailer. The second pass resolves
/// deltas, either from bodies kept in memory or by re-reading the pack file
/// (see [`with_pack_file`]); resolved bases are cached only while deltas
/// still need them.
///
/// Thin packs are rejected: a hash-delta whose base is not in the pack fails
/// with [`PackError::DeltaBaseNotFound`].
///
/// [`with_pack_file`]: Parser::with_pack_file
pub struct Parser<'a, R> {
    scanner: Scanner<R>,
    format: ObjectFormat,
    pack_file: Option<PathBuf>,
    observers: Vec<&'a mut dyn Observer>,
}

impl<'a, R: Read> Parser<'a, R> {
    pub fn new(reader: R, format: ObjectFormat) -> Self {
        Self {
            scanner: Scanner::new(reader, format),
            format,
            pack_file: None,
            observers: Vec::new(),
        }
    }

    /// Resolve deltas by re-reading `path`, which must hold the same bytes
    /// as the stream once the first pass is done.
    pub fn with_pack_file(mut self, path: impl AsRef<Path>) -> Self {
        self.pack_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_observer(mut self, observer: &'a mut dyn Observer) -> Self {
        self.observers.push(observer);
        self
    }

    /// Parse the whole pack. Returns its checksum.
    pub fn parse(mut self) -> PackResult<ObjectHash> {
        let (_, count) = self.scanner.header()?;
        for observer in self.observers.iter_mut() {
            observer.on_header(count)?;
        }

        let keep_bodies = self.pack_file.is_none();
        let mut memory = HashMap::new();
        // The count is untrusted until the entries are actually there.
        let capacity = (count as usize).min(4096);
        let mut entries: Vec<ParsedEntry> = Vec::with_capacity(capacity);
        let mut by_offset: HashMap<u64, usize> = HashMap::with_capacity(capacity);
        let mut by_hash: HashMap<ObjectHash, usize> = HashMap::with_capacity(capacity);

        while let Some(header) = self.scanner.next_object_header()? {
            for observer in self.observers.iter_mut() {
                observer.on_inflated_object_header(header.object_type, header.length, header.offset)?;
            }

            let mut body = Vec::new();
            let (object_type, hash, crc32) = if header.is_delta() {
                let (_, crc32) = if keep_bodies {
                    self.scanner.next_object(&mut body)?
                } else {
                    self.scanner.next_object(&mut io::sink())?
                };
                (None, None, crc32)
            } else {
                let mut sink = ObjectSink {
                    hasher: Hasher::for_object(self.format, header.object_type, header.length),
                    keep: keep_bodies.then_some(&mut body),
                };
                let (_, crc32) = self.scanner.next_object(&mut sink)?;
                let hash = sink.hasher.finalize();
                for observer in self.observers.iter_mut() {
                    observer.on_inflated_object_content(hash, header.offset, crc32, None)?;
                }
                (Some(header.object_type), Some(hash), crc32)
            };

            let pos = entries.len();
            by_offset.insert(header.offset, pos);
            if let Some(hash) = hash {
                by_hash.insert(hash, pos);
            }
            if keep_bodies {
                memory.insert(header.offset, body);
            }
            entries.push(ParsedEntry {
                header,
                crc32,
                object_type,
                hash,
                children: 0,
            });
        }
        let checksum = self.scanner.checksum()?;

        let pending: Vec<usize> = (0..entries.len())
            .filter(|&i| entries[i].header.is_delta())
            .collect();
        if !pending.is_empty() {
            let bodies = match &self.pack_file {
                Some(path) => Bodies::File(Scanner::new(File::open(path)?, self.format)),
                None => Bodies::Memory(memory),
            };
            let mut resolver = Resolver {
                format: self.format,
                entries,
                by_offset,
                by_hash,
                bodies,
                cache: HashMap::new(),
            };
            resolver.resolve_all(pending, &mut self.observers)?;
        }

        for observer in self.observers.iter_mut() {
            observer.on_footer(checksum)?;
        }
        debug!(objects = count, %checksum, "parsed pack");
        Ok(checksum)
    }
}

/// Hashes an inflated body and optionally keeps a copy.
struct ObjectSink<'b> {
    hasher: Hasher,
    keep: Option<&'b mut Vec<u8>>,
}

impl Write for ObjectSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        if let Some(keep) = self.keep.as_mut() {
            keep.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Resolver {
    format: ObjectFormat,
    entries: Vec<ParsedEntry>,
    by_offset: HashMap<u64, usize>,
    by_hash: HashMap<ObjectHash, usize>,
    bodies: Bodies,
    /// Resolved contents kept while offset-deltas still point at them.
    cache: HashMap<usize, Vec<u8>>,
}

impl Resolver {
    fn base_position(&self, pos: usize) -> PackResult<Option<usize>> {
        let header = &self.entries[pos].header;
        if let Some(base_offset) = header.offset_reference {
            return match self.by_offset.get(&base_offset) {
                Some(&base) => Ok(Some(base)),
                None => Err(PackError::corrupt(
                    header.offset,
                    format!("delta base offset {base_offset} is not an entry boundary"),
                )),
            };
        }
        Ok(header.reference.and_then(|hash| self.by_hash.get(&hash).copied()))
    }

    fn resolve_all(
        &mut self,
        mut pending: Vec<usize>,
        observers: &mut [&mut dyn Observer],
    ) -> PackResult<()> {
        for &pos in &pending {
            if self.entries[pos].header.offset_reference.is_some() {
                if let Some(base) = self.base_position(pos)? {
                    self.entries[base].children += 1;
                }
            }
        }

        // Offset-delta bases always come earlier, so one pass settles them.
        // Hash-deltas may wait for a base that is itself a delta.
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::new();
            for pos in pending {
                match self.base_position(pos)? {
                    Some(base) if self.entries[base].hash.is_some() => {
                        self.resolve(pos, base, observers)?
                    }
                    _ => waiting.push(pos),
                }
            }
            if waiting.len() == before {
                let first = &self.entries[waiting[0]].header;
                return Err(match first.reference {
                    Some(hash) => PackError::DeltaBaseNotFound(hash),
                    None => PackError::corrupt(first.offset, "delta chain does not terminate"),
                });
            }
            pending = waiting;
        }
        Ok(())
    }

    fn resolve(
        &mut self,
        pos: usize,
        base: usize,
        observers: &mut [&mut dyn Observer],
    ) -> PackResult<()> {
        let base_data = self.materialize(base)?;
        let target = self.apply(pos, &base_data)?;

        let object_type = self.entries[base].object_type.ok_or_else(|| {
            PackError::corrupt(self.entries[base].header.offset, "unresolved delta base")
        })?;
        let hash = hash_object(self.format, object_type, &target);
        let base_offset = self.entries[base].header.offset;

        let entry = &mut self.entries[pos];
        entry.object_type = Some(object_type);
        entry.hash = Some(hash);
        let (offset, crc32, children) = (entry.header.offset, entry.crc32, entry.children);
        self.by_hash.insert(hash, pos);
        if children > 0 {
            self.cache.insert(pos, target);
        }

        if self.entries[pos].header.offset_reference.is_some() {
            let base_entry = &mut self.entries[base];
            base_entry.children = base_entry.children.saturating_sub(1);
            if base_entry.children == 0 {
                self.cache.remove(&base);
            }
        }

        for observer in observers.iter_mut() {
            observer.on_inflated_object_content(hash, offset, crc32, Some(base_offset))?;
        }
        Ok(())
    }

    /// Full content of an entry whose type is known, rebuilt from its
    /// delta chain when it is not cached.
    fn materialize(&mut self, pos: usize) -> PackResult<Vec<u8>> {
        if let Some(data) = self.cache.get(&pos) {
            return Ok(data.clone());
        }
        if !self.entries[pos].header.is_delta() {
            let data = self.body(pos)?;
            if self.entries[pos].children > 0 {
                self.cache.insert(pos, data.clone());
            }
            return Ok(data);
        }
        let base = self.base_position(pos)?.ok_or_else(|| {
            PackError::corrupt(self.entries[pos].header.offset, "delta base unknown")
        })?;
        let base_data = self.materialize(base)?;
        self.apply(pos, &base_data)
    }

    fn apply(&mut self, pos: usize, base: &[u8]) -> PackResult<Vec<u8>> {
        let delta = self.body(pos)?;
        apply_delta(base, &delta)
            .map_err(|e| PackError::corrupt(self.entries[pos].header.offset, e.to_string()))
    }

    fn body(&mut self, pos: usize) -> PackResult<Vec<u8>> {
        let offset = self.entries[pos].header.offset;
        match &mut self.bodies {
            Bodies::Memory(map) => map
                .get(&offset)
                .cloned()
                .ok_or_else(|| PackError::corrupt(offset, "entry body missing")),
            Bodies::File(scanner) => {
                let header = scanner.seek_object_header(offset)?;
                let mut body = Vec::with_capacity((header.length as usize).min(1 << 20));
                scanner.next_object(&mut body)?;
                Ok(body)
            }
        }
    }
}
