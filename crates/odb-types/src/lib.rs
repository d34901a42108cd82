//! Foundation types for the object database.
//!
//! Every other `odb-*` crate depends on this one.
//!
//! # Key Types
//!
//! - [`ObjectHash`] -- content digest, 20-byte or 32-byte
//! - [`HashFactory`] -- injected capability fixing the digest width of a component
//! - [`Hasher`] -- streaming digest, also usable as an `io::Write` tee
//! - [`ObjectType`] -- commit/tree/blob/tag plus the two delta encodings
//! - [`EncodedObject`] -- a materialized object body with its hash

pub mod error;
pub mod factory;
pub mod hash;
pub mod hasher;
pub mod object;

pub use error::TypeError;
pub use factory::{
    default_factory, factory_for, HashFactory, HexPrefixPolicy, Sha1Factory, Sha256Factory,
    SharedFactory,
};
pub use hash::{ObjectFormat, ObjectHash};
pub use hasher::{hash_object, Hasher};
pub use object::{EncodedObject, ObjectType};
