use std::path::PathBuf;

use odb_index::IndexError;
use odb_pack::PackError;
use odb_types::{ObjectHash, ObjectType};

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No loose file, pack or alternate holds the object.
    #[error("object not found: {0}")]
    NotFound(ObjectHash),

    /// The object exists but is not of the requested type.
    #[error("object {hash} is a {actual}, not a {expected}")]
    TypeMismatch {
        hash: ObjectHash,
        expected: ObjectType,
        actual: ObjectType,
    },

    /// The stored bytes cannot be turned back into the object.
    #[error("corrupt object {hash}: {reason}")]
    CorruptObject { hash: ObjectHash, reason: String },

    /// Only full objects may be written loose.
    #[error("cannot store a {0} object")]
    InvalidType(ObjectType),

    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pack(#[from] PackError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Attach the operation and path to an I/O error.
pub(crate) trait IoResultExt<T> {
    fn with_path(self, op: &'static str, path: impl Into<PathBuf>) -> StoreResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, op: &'static str, path: impl Into<PathBuf>) -> StoreResult<T> {
        self.map_err(|source| StoreError::Io {
            op,
            path: path.into(),
            source,
        })
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}
