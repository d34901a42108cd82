use std::io;

use sha1::Digest;

use crate::hash::{ObjectFormat, ObjectHash};
use crate::object::ObjectType;

/// Streaming digest over one of the supported hash families.
///
/// Implements [`io::Write`] so it can be teed next to any writer.
#[derive(Clone)]
pub enum Hasher {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl Hasher {
    pub fn new(format: ObjectFormat) -> Self {
        match format {
            ObjectFormat::Sha1 => Self::Sha1(sha1::Sha1::new()),
            ObjectFormat::Sha256 => Self::Sha256(sha2::Sha256::new()),
        }
    }

    /// Hasher pre-seeded with the `<type> <size>\0` object header.
    pub fn for_object(format: ObjectFormat, object_type: ObjectType, size: u64) -> Self {
        let mut hasher = Self::new(format);
        hasher.update(object_type.to_string().as_bytes());
        hasher.update(b" ");
        hasher.update(size.to_string().as_bytes());
        hasher.update(&[0]);
        hasher
    }

    pub fn format(&self) -> ObjectFormat {
        match self {
            Self::Sha1(_) => ObjectFormat::Sha1,
            Self::Sha256(_) => ObjectFormat::Sha256,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Digest of everything written so far, without consuming the hasher.
    pub fn sum(&self) -> ObjectHash {
        self.clone().finalize()
    }

    pub fn finalize(self) -> ObjectHash {
        match self {
            Self::Sha1(h) => {
                let mut out = [0u8; 20];
                out.copy_from_slice(&h.finalize());
                ObjectHash::Sha1(out)
            }
            Self::Sha256(h) => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&h.finalize());
                ObjectHash::Sha256(out)
            }
        }
    }
}

impl std::fmt::Debug for Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Hasher").field(&self.format()).finish()
    }
}

impl io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hash an object body the way it is named in the store: the digest of
/// `<type> <size>\0` followed by the body.
pub fn hash_object(format: ObjectFormat, object_type: ObjectType, data: &[u8]) -> ObjectHash {
    let mut hasher = Hasher::for_object(format, object_type, data.len() as u64);
    hasher.update(data);
    hasher.finalize()
}
