use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};

use flate2::bufread::ZlibDecoder;
use odb_types::{Hasher, ObjectFormat, ObjectHash, ObjectType};

use crate::error::{PackError, PackResult};
use crate::header::{decode_entry_head, decode_ofs, decode_pack_header, ObjectHeader, HEADER_LEN};

/// Buffered byte source that knows its position and keeps a CRC32 of the
/// current entry plus a running digest of everything consumed.
struct Source<R> {
    inner: BufReader<R>,
    offset: u64,
    crc: crc32fast::Hasher,
    hasher: Hasher,
    /// Cleared after a seek: the running digest only covers sequential reads.
    hashing: bool,
}

impl<R: Read> Source<R> {
    fn new(reader: R, format: ObjectFormat) -> Self {
        Self {
            inner: BufReader::with_capacity(64 * 1024, reader),
            offset: 0,
            crc: crc32fast::Hasher::new(),
            hasher: Hasher::new(format),
            hashing: true,
        }
    }

    fn reset_crc(&mut self) {
        self.crc = crc32fast::Hasher::new();
    }
}

impl<R: Read> BufRead for Source<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        let used = &self.inner.buffer()[..amt];
        self.crc.update(used);
        if self.hashing {
            self.hasher.update(used);
        }
        self.offset += amt as u64;
        self.inner.consume(amt);
    }
}

impl<R: Read> Read for Source<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = {
            let buf = self.fill_buf()?;
            let n = buf.len().min(out.len());
            out[..n].copy_from_slice(&buf[..n]);
            n
        };
        self.consume(n);
        Ok(n)
    }
}

/// Sequential and random-access reader over a pack stream.
///
/// Sequential use: [`header`], then alternate [`next_object_header`] and
/// [`next_object`] for every entry, then [`checksum`]. With a seekable
/// source, [`seek_object_header`] jumps straight to one entry.
///
/// The scanner only surfaces entry headers and inflated bodies; it never
/// resolves deltas.
///
/// [`header`]: Scanner::header
/// [`next_object_header`]: Scanner::next_object_header
/// [`next_object`]: Scanner::next_object
/// [`checksum`]: Scanner::checksum
/// [`seek_object_header`]: Scanner::seek_object_header
pub struct Scanner<R> {
    src: Source<R>,
    format: ObjectFormat,
    version: u32,
    count: u32,
    header_read: bool,
    remaining: u32,
    /// Header of the entry whose body has not been consumed yet.
    pending: Option<ObjectHeader>,
}

impl<R: Read> Scanner<R> {
    pub fn new(reader: R, format: ObjectFormat) -> Self {
        Self {
            src: Source::new(reader, format),
            format,
            version: 0,
            count: 0,
            header_read: false,
            remaining: 0,
            pending: None,
        }
    }

    pub fn format(&self) -> ObjectFormat {
        self.format
    }

    /// Current position in the stream.
    pub fn offset(&self) -> u64 {
        self.src.offset
    }

    pub fn into_inner(self) -> R {
        self.src.inner.into_inner()
    }

    /// Read and validate the pack header. Returns (version, object count).
    pub fn header(&mut self) -> PackResult<(u32, u32)> {
        if self.header_read {
            return Ok((self.version, self.count));
        }
        let mut raw = [0u8; 12];
        self.src
            .read_exact(&mut raw)
            .map_err(|e| short_read(e, 0, "pack header"))?;
        let (version, count) = decode_pack_header(&raw)?;
        self.version = version;
        self.count = count;
        self.remaining = count;
        self.header_read = true;
        Ok((version, count))
    }

    /// Header of the next entry, or `None` once every entry has been read.
    /// An unread body of the previous entry is skipped.
    pub fn next_object_header(&mut self) -> PackResult<Option<ObjectHeader>> {
        self.header()?;
        if self.pending.is_some() {
            self.next_object(&mut io::sink())?;
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        let header = self.read_object_header()?;
        self.remaining -= 1;
        Ok(Some(header))
    }

    fn read_object_header(&mut self) -> PackResult<ObjectHeader> {
        let offset = self.src.offset;
        self.src.reset_crc();

        let (code, length) =
            decode_entry_head(&mut self.src).map_err(|e| short_read(e, offset, "entry header"))?;
        let object_type = ObjectType::from_pack_code(code)
            .ok_or_else(|| PackError::corrupt(offset, format!("unknown type code {code}")))?;

        let mut header = ObjectHeader {
            object_type,
            offset,
            length,
            content_offset: 0,
            reference: None,
            offset_reference: None,
        };
        match object_type {
            ObjectType::OfsDelta => {
                let distance =
                    decode_ofs(&mut self.src).map_err(|e| short_read(e, offset, "delta offset"))?;
                let base = offset
                    .checked_sub(distance)
                    .filter(|&base| distance > 0 && base >= HEADER_LEN)
                    .ok_or_else(|| {
                        PackError::corrupt(offset, format!("delta base distance {distance} out of range"))
                    })?;
                header.offset_reference = Some(base);
            }
            ObjectType::RefDelta => {
                let mut raw = vec![0u8; self.format.size()];
                self.src
                    .read_exact(&mut raw)
                    .map_err(|e| short_read(e, offset, "delta base hash"))?;
                header.reference = ObjectHash::from_bytes(&raw);
            }
            _ => {}
        }
        header.content_offset = self.src.offset;
        self.pending = Some(header.clone());
        Ok(header)
    }

    /// Inflate the body of the entry whose header was just read into `out`.
    /// Returns (inflated length, CRC32 of the whole packed entry).
    pub fn next_object(&mut self, out: &mut impl Write) -> PackResult<(u64, u32)> {
        let header = self
            .pending
            .take()
            .ok_or_else(|| PackError::corrupt(self.src.offset, "no entry header was read"))?;
        let written = {
            let mut zlib = ZlibDecoder::new(&mut self.src);
            io::copy(&mut zlib, out).map_err(|e| inflate_error(e, header.offset))?
        };
        if written != header.length {
            return Err(PackError::corrupt(
                header.offset,
                format!("inflated {written} bytes, header declares {}", header.length),
            ));
        }
        Ok((written, self.src.crc.clone().finalize()))
    }

    /// Inflate at most `limit` bytes of the pending body. The rest stays
    /// unread; the next seek or header read discards it.
    pub fn next_object_prefix(&mut self, limit: usize) -> PackResult<Vec<u8>> {
        let header = self
            .pending
            .clone()
            .ok_or_else(|| PackError::corrupt(self.src.offset, "no entry header was read"))?;
        let mut out = Vec::with_capacity(limit);
        ZlibDecoder::new(&mut self.src)
            .take(limit as u64)
            .read_to_end(&mut out)
            .map_err(|e| inflate_error(e, header.offset))?;
        Ok(out)
    }

    /// Verify the trailer against the digest of everything read so far.
    /// Only valid after a sequential scan of every entry.
    pub fn checksum(&mut self) -> PackResult<ObjectHash> {
        if self.pending.is_some() {
            self.next_object(&mut io::sink())?;
        }
        if !self.src.hashing {
            return Err(PackError::corrupt(self.src.offset, "checksum requires a sequential scan"));
        }
        while self.next_object_header()?.is_some() {}

        let actual = self.src.hasher.sum();
        let mut raw = vec![0u8; self.format.size()];
        self.src
            .read_exact(&mut raw)
            .map_err(|e| short_read(e, self.src.offset, "pack trailer"))?;
        let expected = ObjectHash::from_bytes(&raw)
            .ok_or_else(|| PackError::corrupt(self.src.offset, "bad trailer width"))?;
        if expected != actual {
            return Err(PackError::ChecksumMismatch { expected, actual });
        }
        Ok(actual)
    }
}

impl<R: Read + Seek> Scanner<R> {
    /// Jump to the entry starting at `offset` and read its header.
    pub fn seek_object_header(&mut self, offset: u64) -> PackResult<ObjectHeader> {
        if !self.header_read {
            self.header()?;
        }
        if offset < HEADER_LEN {
            return Err(PackError::corrupt(offset, "offset inside the pack header"));
        }
        self.src.inner.seek(SeekFrom::Start(offset))?;
        self.src.offset = offset;
        self.src.hashing = false;
        self.pending = None;
        self.read_object_header()
    }
}

fn short_read(e: io::Error, offset: u64, what: &str) -> PackError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => PackError::corrupt(offset, format!("truncated {what}")),
        io::ErrorKind::InvalidData => PackError::corrupt(offset, format!("bad {what}: {e}")),
        _ => PackError::Io(e),
    }
}

fn inflate_error(e: io::Error, offset: u64) -> PackError {
    match e.kind() {
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            PackError::corrupt(offset, format!("inflate failed: {e}"))
        }
        _ => PackError::Io(e),
    }
}
