//! Object storage for the object database.
//!
//! An objects directory holds loose objects (one zlib file per object,
//! sharded by the first hash byte) and packs (`pack/pack-<hex>.pack` with
//! its `.idx`). It may point at other objects directories through
//! `info/alternates`, which are searched after the local sources.
//!
//! # Storage Backends
//!
//! All backends implement the [`ObjectStorer`] trait:
//!
//! - [`ObjectStorage`] -- the filesystem store: loose objects, packs and
//!   alternates, with delta resolution and a content cache
//! - [`InMemoryObjectStore`] -- `HashMap`-based store for tests and embedding
//!
//! # Supporting Pieces
//!
//! - [`PackWriter`] -- streams a received pack to disk and indexes it on the fly
//! - [`LooseReader`] / [`LooseWriter`] -- the loose object file format
//! - [`ObjectLru`] -- byte-bounded content cache behind [`ObjectCache`]
//! - [`StoreOptions`] -- configuration, loadable from TOML
//!
//! # Design Rules
//!
//! 1. Objects are immutable once written; the same content always has the same hash.
//! 2. Files appear atomically: data goes to a temp file that is renamed into place.
//! 3. A pack's index is written before the pack itself becomes visible.
//! 4. Concurrent reads are always safe.
//! 5. Only full objects are written loose. Deltas live inside packs.
//! 6. All I/O errors are propagated with the operation and path that failed.

pub mod buffer_pool;
pub mod cache;
pub mod descriptors;
pub mod error;
pub mod loose;
pub mod memory;
pub mod objects_dir;
pub mod options;
pub mod pack_writer;
pub mod storage;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use cache::{ObjectCache, ObjectLru};
pub use descriptors::{DescriptorMode, DescriptorState};
pub use error::{StoreError, StoreResult};
pub use loose::{LooseReader, LooseWriter};
pub use memory::InMemoryObjectStore;
pub use objects_dir::ObjectsDir;
pub use options::{LookupOrder, StoreOptions};
pub use pack_writer::PackWriter;
pub use storage::{DeltaObject, ObjectStorage, StoredObject};
pub use traits::{ObjectIter, ObjectStorer};
