use odb_index::IndexError;
use odb_types::ObjectHash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("invalid pack signature: {0:02x?}")]
    InvalidSignature([u8; 4]),

    #[error("unsupported pack version: {0}")]
    UnsupportedVersion(u32),

    #[error("pack checksum mismatch: trailer {expected}, computed {actual}")]
    ChecksumMismatch {
        expected: ObjectHash,
        actual: ObjectHash,
    },

    #[error("object not found in pack: {0}")]
    ObjectNotFound(ObjectHash),

    #[error("corrupt pack entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    /// A hash-delta names a base that is not in this pack (a thin pack).
    #[error("delta base not found: {0}")]
    DeltaBaseNotFound(ObjectHash),

    #[error("bad offset for offset-delta entry: {0}")]
    InvalidDeltaOffset(i64),

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PackResult<T> = Result<T, PackError>;

impl PackError {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptEntry {
            offset,
            reason: reason.into(),
        }
    }
}
