//! Packfile codec for the object database.
//!
//! A pack is a 12-byte header (`PACK`, version, object count), a sequence
//! of zlib-compressed entries, and a trailer digest of everything before
//! it. Entries are full objects or deltas against another entry, named
//! either by relative offset or by hash.
//!
//! # Architecture
//!
//! - **PackEncoder**: writes a pack from a [`PackPlan`], bases before deltas
//! - **DeltaSelector**: decides which objects become deltas
//! - **Scanner**: sequential and random-access entry reader
//! - **Parser**: single streaming pass that feeds [`Observer`]s, such as the
//!   index writer
//! - **Packfile**: random access to raw entries through a pack index

pub mod delta;
pub mod encoder;
pub mod error;
pub mod header;
pub mod packfile;
pub mod parser;
pub mod scanner;

pub use delta::{apply_delta, delta_sizes, encode_delta};
pub use encoder::{DeltaSelector, ObjectToPack, PackEncoder, PackPlan, WindowSelector};
pub use error::{PackError, PackResult};
pub use header::{ObjectHeader, HEADER_LEN, SIGNATURE, VERSION};
pub use packfile::Packfile;
pub use parser::{Observer, Parser};
pub use scanner::Scanner;
