use std::io::Write;

use odb_types::{Hasher, ObjectHash};
use tracing::debug;

use crate::decoder::MAGIC;
use crate::error::{IndexError, IndexResult};
use crate::memory::{PackIndex, Tables, Version, FANOUT};

/// Writes a [`PackIndex`] in `.idx` form.
///
/// The index checksum is the running digest of everything written before
/// it; it is also stored back into the index.
pub struct IndexEncoder<W> {
    writer: W,
    version: Option<Version>,
}

impl<W: Write> IndexEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            version: None,
        }
    }

    /// Write a specific layout instead of the one the index was read as.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Encode `index`, returning the index checksum.
    ///
    /// Fails with [`IndexError::Locked`] instead of waiting when the index
    /// is being built or is otherwise held exclusively.
    pub fn encode(&mut self, index: &PackIndex) -> IndexResult<ObjectHash> {
        let mut tables = index.try_exclusive()?;
        if !tables.complete {
            return Err(IndexError::Locked);
        }
        let version = self.version.unwrap_or(tables.version);

        let mut out = HashingWriter {
            inner: &mut self.writer,
            hasher: index.factory().hasher(),
        };
        match version {
            Version::V1 => write_v1(&mut out, &tables)?,
            Version::V2 | Version::V3 => write_v2(&mut out, &tables, version)?,
        }
        out.write_all(tables.pack_checksum.as_bytes())?;

        let checksum = out.hasher.sum();
        self.writer.write_all(checksum.as_bytes())?;
        self.writer.flush()?;

        tables.idx_checksum = checksum;
        debug!(
            version = version.as_u32(),
            count = tables.count(),
            checksum = %checksum,
            "encoded pack index"
        );
        Ok(checksum)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn write_fanout(out: &mut impl Write, tables: &Tables) -> IndexResult<()> {
    for count in &tables.fanout {
        out.write_all(&count.to_be_bytes())?;
    }
    Ok(())
}

fn write_v2(out: &mut impl Write, tables: &Tables, version: Version) -> IndexResult<()> {
    out.write_all(&MAGIC)?;
    out.write_all(&version.as_u32().to_be_bytes())?;
    write_fanout(out, tables)?;
    for bucket in &tables.buckets {
        out.write_all(&bucket.names)?;
    }
    for bucket in &tables.buckets {
        out.write_all(&bucket.crc32)?;
    }
    for bucket in &tables.buckets {
        out.write_all(&bucket.offset32)?;
    }
    out.write_all(&tables.offset64)?;
    Ok(())
}

fn write_v1(out: &mut impl Write, tables: &Tables) -> IndexResult<()> {
    write_fanout(out, tables)?;
    let size = tables.pack_checksum.size();
    for b in 0..FANOUT {
        let bucket = &tables.buckets[b];
        for pos in 0..bucket.len() {
            let offset = tables.offset_at(b, pos);
            let offset = u32::try_from(offset).map_err(|_| {
                IndexError::Unencodable(format!("offset {offset} does not fit a v1 index"))
            })?;
            out.write_all(&offset.to_be_bytes())?;
            out.write_all(bucket.name_at(pos, size))?;
        }
    }
    Ok(())
}

struct HashingWriter<'a, W> {
    inner: &'a mut W,
    hasher: Hasher,
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::IndexDecoder;
    use crate::entry::Entry;
    use crate::writer::IndexWriter;
    use odb_types::default_factory;
    use proptest::prelude::*;

    fn entry(seed: u8, offset: u64) -> Entry {
        let mut bytes = [seed; 20];
        bytes[19] = seed.wrapping_add(1);
        Entry {
            hash: ObjectHash::from(bytes),
            crc32: seed as u32 * 7,
            offset,
        }
    }

    #[test]
    fn encode_fails_fast_while_building() {
        let idx = PackIndex::empty(default_factory());
        let guard = idx.begin_build().unwrap();
        let result = IndexEncoder::new(Vec::new()).encode(&idx);
        assert!(matches!(result, Err(IndexError::Locked)));
        drop(guard);
    }

    #[test]
    fn encode_rejects_unfinished_writer() {
        let mut writer = IndexWriter::new(default_factory());
        writer.on_header(1).unwrap();
        let e = entry(3, 12);
        writer
            .on_inflated_object_content(e.hash, e.offset, e.crc32, None)
            .unwrap();

        let result = IndexEncoder::new(Vec::new()).encode(&writer.handle());
        assert!(matches!(result, Err(IndexError::Locked)));

        writer.on_footer(ObjectHash::from([9u8; 20])).unwrap();
        assert!(IndexEncoder::new(Vec::new()).encode(&writer.handle()).is_ok());
    }

    #[test]
    fn checksum_is_digest_of_preceding_bytes() {
        let idx = PackIndex::from_entries(
            default_factory(),
            vec![entry(1, 12), entry(200, 40)],
            ObjectHash::from([5u8; 20]),
        );
        let mut out = Vec::new();
        let checksum = IndexEncoder::new(&mut out).encode(&idx).unwrap();

        let (body, trailer) = out.split_at(out.len() - 20);
        let mut hasher = default_factory().hasher();
        hasher.update(body);
        assert_eq!(hasher.finalize(), checksum);
        assert_eq!(trailer, checksum.as_bytes());
        assert_eq!(idx.idx_checksum(), checksum);
    }

    proptest! {
        #[test]
        fn encode_decode_preserves_lookups(
            raw in proptest::collection::btree_map(any::<[u8; 20]>(), (any::<u32>(), 0u64..(1 << 40)), 0..64)
        ) {
            let entries: Vec<Entry> = raw
                .into_iter()
                .map(|(bytes, (crc32, offset))| Entry { hash: ObjectHash::from(bytes), crc32, offset })
                .collect();
            let idx = PackIndex::from_entries(default_factory(), entries.clone(), ObjectHash::from([1u8; 20]));

            let mut out = Vec::new();
            IndexEncoder::new(&mut out).encode(&idx).unwrap();
            let back = IndexDecoder::new(&out[..], default_factory()).decode().unwrap();

            prop_assert_eq!(back.count(), entries.len() as u64);
            for e in &entries {
                prop_assert_eq!(back.find_offset(&e.hash), Some(e.offset));
                prop_assert_eq!(back.find_crc32(&e.hash), Some(e.crc32));
            }
            let fanout = back.fanout();
            prop_assert!(fanout.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
