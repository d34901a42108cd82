use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid index magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported index version: {0}")]
    UnsupportedVersion(u32),

    #[error("index corrupted: {0}")]
    Corrupted(String),

    /// The index is still being built, or another caller holds it exclusively.
    #[error("index is locked: a build is in progress")]
    Locked,

    #[error("index writer has not seen the pack footer yet")]
    Incomplete,

    #[error("index cannot be encoded: {0}")]
    Unencodable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Map a short read to structural corruption, keep other I/O errors as-is.
pub(crate) fn truncated(section: &str) -> impl FnOnce(std::io::Error) -> IndexError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IndexError::Corrupted(format!("truncated {section}"))
        } else {
            IndexError::Io(e)
        }
    }
}
