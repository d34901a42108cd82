use std::io::{BufReader, Read};

use odb_types::{ObjectHash, SharedFactory};
use tracing::debug;

use crate::error::{truncated, IndexError, IndexResult};
use crate::memory::{read_u32, Bucket, PackIndex, Tables, Version, FANOUT, IS_O64_MASK};

/// Index file signature: `\xFF t O c`.
pub const MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];

/// Reads `.idx` files of any version into a [`PackIndex`].
///
/// The layout is inferred from the content: a leading magic means v2/v3,
/// anything else is the headerless v1 layout whose first four bytes are
/// already the first fan-out slot.
pub struct IndexDecoder<R> {
    reader: BufReader<R>,
    factory: SharedFactory,
}

impl<R: Read> IndexDecoder<R> {
    pub fn new(reader: R, factory: SharedFactory) -> Self {
        Self {
            reader: BufReader::new(reader),
            factory,
        }
    }

    pub fn decode(mut self) -> IndexResult<PackIndex> {
        let mut head = [0u8; 4];
        self.read_exact(&mut head, "header")?;

        let mut fanout = [0u32; FANOUT];
        let version = if head == MAGIC {
            let mut raw = [0u8; 4];
            self.read_exact(&mut raw, "version")?;
            let version = match u32::from_be_bytes(raw) {
                2 => Version::V2,
                3 => Version::V3,
                other => return Err(IndexError::UnsupportedVersion(other)),
            };
            self.read_fanout(&mut fanout, 0)?;
            version
        } else if head[0] == 0xff {
            // A v1 first fan-out slot this large is not a plausible object count.
            return Err(IndexError::InvalidMagic(head));
        } else {
            fanout[0] = u32::from_be_bytes(head);
            self.read_fanout(&mut fanout, 1)?;
            Version::V1
        };

        for i in 1..FANOUT {
            if fanout[i] < fanout[i - 1] {
                return Err(IndexError::Corrupted(format!(
                    "fanout decreases at bucket {i:#04x}"
                )));
            }
        }

        let mut tables = Tables::empty(self.factory.format());
        tables.version = version;
        tables.fanout = fanout;

        match version {
            Version::V1 => self.read_v1_records(&mut tables)?,
            Version::V2 | Version::V3 => self.read_v2_tables(&mut tables)?,
        }

        tables.pack_checksum = self.read_hash("pack checksum")?;
        tables.idx_checksum = self.read_hash("index checksum")?;

        let mut extra = [0u8; 1];
        if self.reader.read(&mut extra)? != 0 {
            return Err(IndexError::Corrupted("trailing bytes after index checksum".into()));
        }

        tables.complete = true;
        debug!(
            version = version.as_u32(),
            count = tables.count(),
            pack = %tables.pack_checksum,
            "decoded pack index"
        );
        Ok(PackIndex::from_tables(self.factory, tables))
    }

    fn read_exact(&mut self, buf: &mut [u8], section: &str) -> IndexResult<()> {
        self.reader.read_exact(buf).map_err(truncated(section))
    }

    fn read_vec(&mut self, len: usize, section: &str) -> IndexResult<Vec<u8>> {
        let mut buf = Vec::new();
        let read = (&mut self.reader).take(len as u64).read_to_end(&mut buf)?;
        if read != len {
            return Err(IndexError::Corrupted(format!("truncated {section}")));
        }
        Ok(buf)
    }

    fn read_fanout(&mut self, fanout: &mut [u32; FANOUT], from: usize) -> IndexResult<()> {
        let raw = self.read_vec((FANOUT - from) * 4, "fanout table")?;
        for (slot, chunk) in fanout[from..].iter_mut().zip(raw.chunks_exact(4)) {
            *slot = read_u32(chunk);
        }
        Ok(())
    }

    fn read_hash(&mut self, section: &str) -> IndexResult<ObjectHash> {
        let raw = self.read_vec(self.factory.size(), section)?;
        self.factory
            .from_bytes(&raw)
            .ok_or_else(|| IndexError::Corrupted(format!("bad {section} width")))
    }

    fn bucket_len(tables: &Tables, bucket: usize) -> usize {
        let start = if bucket == 0 { 0 } else { tables.fanout[bucket - 1] };
        (tables.fanout[bucket] - start) as usize
    }

    fn read_v2_tables(&mut self, tables: &mut Tables) -> IndexResult<()> {
        let size = self.factory.size();
        for b in 0..FANOUT {
            let len = Self::bucket_len(tables, b);
            tables.buckets[b].names = self.read_vec(len * size, "name table")?;
            check_bucket_names(&tables.buckets[b], b, size)?;
        }
        for b in 0..FANOUT {
            let len = Self::bucket_len(tables, b);
            tables.buckets[b].crc32 = self.read_vec(len * 4, "crc32 table")?;
        }
        let mut large = 0usize;
        for b in 0..FANOUT {
            let len = Self::bucket_len(tables, b);
            let raw = self.read_vec(len * 4, "offset table")?;
            large += raw
                .chunks_exact(4)
                .filter(|c| read_u32(c) & IS_O64_MASK != 0)
                .count();
            tables.buckets[b].offset32 = raw;
        }
        tables.offset64 = self.read_vec(large * 8, "64-bit offset table")?;

        for bucket in &tables.buckets {
            for chunk in bucket.offset32.chunks_exact(4) {
                let raw = read_u32(chunk);
                if raw & IS_O64_MASK != 0 && (raw & !IS_O64_MASK) as usize >= large {
                    return Err(IndexError::Corrupted(format!(
                        "64-bit offset index {} out of range",
                        raw & !IS_O64_MASK
                    )));
                }
            }
        }
        Ok(())
    }

    fn read_v1_records(&mut self, tables: &mut Tables) -> IndexResult<()> {
        let size = self.factory.size();
        let mut large = 0u32;
        for b in 0..FANOUT {
            let len = Self::bucket_len(tables, b);
            let raw = self.read_vec(len * (4 + size), "v1 entry table")?;
            let bucket = &mut tables.buckets[b];
            for record in raw.chunks_exact(4 + size) {
                let offset = read_u32(record);
                if offset & IS_O64_MASK != 0 {
                    bucket
                        .offset32
                        .extend_from_slice(&(large | IS_O64_MASK).to_be_bytes());
                    tables.offset64.extend_from_slice(&(offset as u64).to_be_bytes());
                    large += 1;
                } else {
                    bucket.offset32.extend_from_slice(&offset.to_be_bytes());
                }
                bucket.names.extend_from_slice(&record[4..]);
                bucket.crc32.extend_from_slice(&[0; 4]);
            }
            check_bucket_names(bucket, b, size)?;
        }
        Ok(())
    }
}

fn check_bucket_names(bucket: &Bucket, index: usize, size: usize) -> IndexResult<()> {
    let mut previous: Option<&[u8]> = None;
    for name in bucket.names.chunks_exact(size) {
        if name[0] as usize != index {
            return Err(IndexError::Corrupted(format!(
                "name {} filed under bucket {index:#04x}",
                hex::encode(name)
            )));
        }
        if let Some(prev) = previous {
            if prev >= name {
                return Err(IndexError::Corrupted(format!(
                    "names out of order in bucket {index:#04x}"
                )));
            }
        }
        previous = Some(name);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::IndexEncoder;
    use crate::entry::Entry;
    use base64::Engine;
    use odb_types::{default_factory, factory_for, HexPrefixPolicy, ObjectFormat};

    const LARGE_4GB: &str = include_str!("../testdata/large-4gb.idx.b64");

    fn large_fixture() -> Vec<u8> {
        let compact: String = LARGE_4GB.split_whitespace().collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact)
            .unwrap()
    }

    fn decode(bytes: &[u8]) -> IndexResult<PackIndex> {
        IndexDecoder::new(bytes, default_factory()).decode()
    }

    fn h(hex: &str) -> ObjectHash {
        ObjectHash::from_hex(hex).unwrap()
    }

    #[test]
    fn decode_large_offsets() {
        let idx = decode(&large_fixture()).unwrap();
        assert_eq!(idx.version(), Version::V2);
        assert_eq!(idx.count(), 9);

        let expected = [
            ("303953e5aa461c203a324821bc1717f9b4fff895", 12u64),
            ("5296768e3d9f661387ccbff18c4dea6c997fd78c", 142),
            ("03fc8d58d44267274edef4585eaeeb445879d33f", 1_601_322_837),
            ("8f3ceb4ea4cb9e4a0f751795eb41c9a4f07be772", 2_646_996_529),
            ("e0d1d625010087f79c9e01ad9d8f95e1628dda02", 3_452_385_606),
            ("90eba326cdc4d1d61c5ad25224ccbf08731dd041", 3_707_047_470),
            ("bab53055add7bc35882758a922c54a874d6b1272", 5_323_223_332),
            ("1b8995f51987d8a449ca5ea4356595102dc2fbd4", 5_894_072_943),
            ("35858be9c6f5914cbe6768489c41eb6809a2bceb", 5_924_278_919),
        ];
        for (hex, offset) in expected {
            assert_eq!(idx.find_offset(&h(hex)), Some(offset), "{hex}");
            assert_eq!(idx.find_hash(offset), Some(h(hex)));
        }

        let entries: Vec<Entry> = idx.entries().collect();
        assert_eq!(entries.len(), 9);
        assert!(entries.windows(2).all(|w| w[0].hash < w[1].hash));

        let by_offset: Vec<u64> = idx.entries_by_offset().map(|e| e.offset).collect();
        let mut sorted: Vec<u64> = expected.iter().map(|(_, o)| *o).collect();
        sorted.sort();
        assert_eq!(by_offset, sorted);
    }

    #[test]
    fn decode_records_checksums() {
        let bytes = large_fixture();
        let idx = decode(&bytes).unwrap();
        let n = bytes.len();
        assert_eq!(idx.idx_checksum().as_bytes(), &bytes[n - 20..]);
        assert_eq!(idx.pack_checksum().as_bytes(), &bytes[n - 40..n - 20]);
    }

    #[test]
    fn decode_encode_is_byte_exact() {
        let bytes = large_fixture();
        let idx = decode(&bytes).unwrap();
        let mut out = Vec::new();
        let checksum = IndexEncoder::new(&mut out).encode(&idx).unwrap();
        assert_eq!(out, bytes);
        assert_eq!(checksum, idx.idx_checksum());
    }

    #[test]
    fn version_three_keeps_the_v2_layout() {
        let mut bytes = large_fixture();
        bytes[7] = 3;
        let idx = decode(&bytes).unwrap();
        assert_eq!(idx.version(), Version::V3);
        assert_eq!(idx.count(), 9);

        let mut out = Vec::new();
        IndexEncoder::new(&mut out).encode(&idx).unwrap();
        assert_eq!(&out[..out.len() - 20], &bytes[..bytes.len() - 20]);
    }

    #[test]
    fn unsupported_version() {
        let mut bytes = large_fixture();
        bytes[7] = 9;
        assert!(matches!(decode(&bytes), Err(IndexError::UnsupportedVersion(9))));
    }

    #[test]
    fn invalid_magic() {
        let mut bytes = large_fixture();
        bytes[1] = b'x';
        assert!(matches!(decode(&bytes), Err(IndexError::InvalidMagic(_))));
    }

    #[test]
    fn decreasing_fanout_is_corruption() {
        let mut bytes = large_fixture();
        // fanout[0x10] lives at 8 + 0x10 * 4; bump it above its successors.
        let at = 8 + 0x10 * 4;
        bytes[at..at + 4].copy_from_slice(&100u32.to_be_bytes());
        assert!(matches!(decode(&bytes), Err(IndexError::Corrupted(_))));
    }

    #[test]
    fn truncated_input_is_corruption() {
        let bytes = large_fixture();
        for cut in [3, 8, 500, bytes.len() - 300, bytes.len() - 1] {
            assert!(
                matches!(decode(&bytes[..cut]), Err(IndexError::Corrupted(_))),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut bytes = large_fixture();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(IndexError::Corrupted(_))));
    }

    #[test]
    fn checksum_width_follows_factory() {
        // A sha256 reader expects 64 trailing checksum bytes and wider names.
        let sha256 = factory_for(ObjectFormat::Sha256, HexPrefixPolicy::Strict);
        let result = IndexDecoder::new(&large_fixture()[..], sha256).decode();
        assert!(matches!(result, Err(IndexError::Corrupted(_))));
    }

    #[test]
    fn misfiled_name_is_corruption() {
        let mut bytes = large_fixture();
        // First name sits right after the fanout; flip its leading byte.
        let at = 8 + 1024;
        bytes[at] ^= 0x40;
        assert!(matches!(decode(&bytes), Err(IndexError::Corrupted(_))));
    }

    #[test]
    fn empty_index_roundtrip() {
        let idx = PackIndex::from_entries(default_factory(), vec![], ObjectHash::zero(ObjectFormat::Sha1));
        let mut out = Vec::new();
        IndexEncoder::new(&mut out).encode(&idx).unwrap();
        assert_eq!(out.len(), 8 + 1024 + 40);

        let back = decode(&out).unwrap();
        assert_eq!(back.count(), 0);
        assert_eq!(back.entries().count(), 0);
    }

    #[test]
    fn v1_roundtrip() {
        let idx = decode(&large_fixture()).unwrap();
        // v1 stores 32-bit offsets only; keep the entries that fit.
        let small: Vec<Entry> = idx.entries().filter(|e| e.offset <= u32::MAX as u64).collect();
        let small = PackIndex::from_entries(default_factory(), small, idx.pack_checksum());

        let mut out = Vec::new();
        IndexEncoder::new(&mut out)
            .with_version(Version::V1)
            .encode(&small)
            .unwrap();
        assert_ne!(&out[..4], &MAGIC);

        let back = decode(&out).unwrap();
        assert_eq!(back.version(), Version::V1);
        assert_eq!(back.count(), small.count());
        for entry in small.entries() {
            assert_eq!(back.find_offset(&entry.hash), Some(entry.offset));
            assert_eq!(back.find_crc32(&entry.hash), Some(0));
        }
    }

    #[test]
    fn v1_rejects_offsets_past_four_gib() {
        let idx = decode(&large_fixture()).unwrap();
        let result = IndexEncoder::new(Vec::new())
            .with_version(Version::V1)
            .encode(&idx);
        assert!(matches!(result, Err(IndexError::Unencodable(_))));
    }

    #[test]
    fn sha256_roundtrip() {
        let factory = factory_for(ObjectFormat::Sha256, HexPrefixPolicy::Strict);
        let entries: Vec<Entry> = (0..5u8)
            .map(|i| Entry {
                hash: ObjectHash::from([i * 50; 32]),
                crc32: i as u32,
                offset: 12 + i as u64,
            })
            .collect();
        let idx = PackIndex::from_entries(factory.clone(), entries.clone(), ObjectHash::from([7u8; 32]));
        let mut out = Vec::new();
        IndexEncoder::new(&mut out).encode(&idx).unwrap();

        let back = IndexDecoder::new(&out[..], factory).decode().unwrap();
        for e in entries {
            assert_eq!(back.find_offset(&e.hash), Some(e.offset));
            assert_eq!(back.find_crc32(&e.hash), Some(e.crc32));
        }
        assert_eq!(back.idx_checksum(), idx.idx_checksum());
    }
}
