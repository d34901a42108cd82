//! Pack index for the object database.
//!
//! A pack index maps each object hash in one pack to its byte offset and
//! the CRC32 of its packed entry. This crate reads and writes the `.idx`
//! format (v1, v2 and v3), keeps the tables in memory for lookups, and
//! builds new indices while a pack is being parsed.

pub mod decoder;
pub mod encoder;
pub mod entry;
pub mod error;
pub mod memory;
pub mod writer;

pub use decoder::{IndexDecoder, MAGIC};
pub use encoder::IndexEncoder;
pub use entry::{Entry, EntryIter, OffsetEntryIter};
pub use error::{IndexError, IndexResult};
pub use memory::{PackIndex, Version, FANOUT};
pub use writer::IndexWriter;
