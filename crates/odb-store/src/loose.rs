//! Loose object files: `<type> <size>\0<body>`, zlib-compressed.

use std::fs;
use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use odb_types::{Hasher, ObjectFormat, ObjectHash, ObjectType};
use tempfile::NamedTempFile;
use tracing::trace;

use crate::error::{IoResultExt, StoreResult};
use crate::objects_dir::ObjectsDir;

const MAX_HEADER_LEN: usize = 64;

/// Reads one loose object. The header is parsed on construction, so the
/// type and size are known without inflating the body.
pub struct LooseReader<R: Read> {
    zlib: ZlibDecoder<R>,
    object_type: ObjectType,
    size: u64,
}

impl<R: Read> LooseReader<R> {
    pub fn new(reader: R) -> io::Result<Self> {
        let mut zlib = ZlibDecoder::new(reader);
        let mut header = Vec::with_capacity(32);
        let mut byte = [0u8; 1];
        loop {
            zlib.read_exact(&mut byte)?;
            if byte[0] == 0 {
                break;
            }
            if header.len() == MAX_HEADER_LEN {
                return Err(invalid("object header too long"));
            }
            header.push(byte[0]);
        }
        let (object_type, size) = parse_header(&header)?;
        Ok(Self {
            zlib,
            object_type,
            size,
        })
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Inflate the whole body through `scratch` and check its length.
    pub fn read_body(mut self, scratch: &mut Vec<u8>) -> io::Result<Vec<u8>> {
        let mut body = Vec::with_capacity((self.size as usize).min(1 << 24));
        scratch.resize(scratch.capacity().max(4096), 0);
        loop {
            let n = self.zlib.read(scratch)?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&scratch[..n]);
            if body.len() as u64 > self.size {
                return Err(invalid("body longer than its header declares"));
            }
        }
        if body.len() as u64 != self.size {
            return Err(invalid("body shorter than its header declares"));
        }
        Ok(body)
    }
}

impl<R: Read> Read for LooseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.zlib.read(buf)
    }
}

fn parse_header(header: &[u8]) -> io::Result<(ObjectType, u64)> {
    let text = std::str::from_utf8(header).map_err(|_| invalid("object header is not text"))?;
    let (kind, size) = text
        .split_once(' ')
        .ok_or_else(|| invalid("object header has no size"))?;
    let object_type: ObjectType = kind
        .parse()
        .ok()
        .filter(|t: &ObjectType| t.is_full())
        .ok_or_else(|| invalid("unknown object type"))?;
    let size = size.parse().map_err(|_| invalid("bad object size"))?;
    Ok((object_type, size))
}

fn invalid(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}

/// Streams one object into a temporary file and moves it into place on
/// [`finish`](LooseWriter::finish).
///
/// The declared size is written up front, so the body must match it.
/// Dropping the writer without finishing leaves nothing behind.
pub struct LooseWriter {
    dir: ObjectsDir,
    zlib: ZlibEncoder<NamedTempFile>,
    hasher: Hasher,
    size: u64,
    written: u64,
}

impl LooseWriter {
    pub fn new(
        dir: &ObjectsDir,
        format: ObjectFormat,
        object_type: ObjectType,
        size: u64,
    ) -> StoreResult<Self> {
        let temp = dir.temp_file(dir.root(), "tmp_obj_")?;
        let path = temp.path().to_path_buf();
        let mut zlib = ZlibEncoder::new(temp, Compression::default());
        zlib.write_all(format!("{object_type} {size}\0").as_bytes())
            .with_path("write loose object", path)?;
        Ok(Self {
            dir: dir.clone(),
            zlib,
            hasher: Hasher::for_object(format, object_type, size),
            size,
            written: 0,
        })
    }

    /// Complete the object and move it to its sharded path. Returns its
    /// hash. An object already present is left untouched.
    pub fn finish(self) -> StoreResult<ObjectHash> {
        let temp_path = self.zlib.get_ref().path().to_path_buf();
        if self.written != self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("wrote {} of {} declared bytes", self.written, self.size),
            ))
            .with_path("write loose object", temp_path);
        }
        let temp = self.zlib.finish().with_path("write loose object", &temp_path)?;
        let hash = self.hasher.finalize();

        let target = self.dir.loose_path(&hash);
        if target.exists() {
            return Ok(hash);
        }
        if let Some(shard) = target.parent() {
            fs::create_dir_all(shard).with_path("create directory", shard)?;
        }
        temp.persist(&target)
            .map_err(|e| e.error)
            .with_path("persist loose object", &target)?;
        trace!(%hash, "wrote loose object");
        Ok(hash)
    }
}

impl Write for LooseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write exceeds the declared object size",
            ));
        }
        let n = self.zlib.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.zlib.flush()
    }
}
