use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::hash::{ObjectFormat, ObjectHash};
use crate::hasher::hash_object;

/// The type of a stored or packed object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
    /// Delta whose base is addressed by a negative offset inside the pack.
    OfsDelta,
    /// Delta whose base is addressed by its full hash.
    RefDelta,
    /// Query wildcard; never stored.
    Any,
}

impl ObjectType {
    /// The 3-bit type code used in pack entry headers. `Any` maps to 0,
    /// which is not a valid code on the wire.
    pub fn pack_code(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
            Self::OfsDelta => 6,
            Self::RefDelta => 7,
            Self::Any => 0,
        }
    }

    pub fn from_pack_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            6 => Some(Self::OfsDelta),
            7 => Some(Self::RefDelta),
            _ => None,
        }
    }

    pub fn is_delta(self) -> bool {
        matches!(self, Self::OfsDelta | Self::RefDelta)
    }

    /// Whether this is a concrete, fully materialized type.
    pub fn is_full(self) -> bool {
        matches!(self, Self::Commit | Self::Tree | Self::Blob | Self::Tag)
    }

    /// Whether an object of this type satisfies a query for `wanted`.
    pub fn matches(self, wanted: ObjectType) -> bool {
        wanted == Self::Any || wanted == self
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
            Self::OfsDelta => "ofs-delta",
            Self::RefDelta => "ref-delta",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

impl FromStr for ObjectType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Self::Commit),
            "tree" => Ok(Self::Tree),
            "blob" => Ok(Self::Blob),
            "tag" => Ok(Self::Tag),
            "ofs-delta" => Ok(Self::OfsDelta),
            "ref-delta" => Ok(Self::RefDelta),
            other => Err(TypeError::UnknownObjectType(other.to_string())),
        }
    }
}

/// A fully materialized object: type tag, body and the hash naming it.
///
/// The body is reference counted so cached copies can be handed out
/// without re-copying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedObject {
    hash: ObjectHash,
    object_type: ObjectType,
    data: Arc<[u8]>,
}

impl EncodedObject {
    /// Build an object and compute its hash in the given format.
    pub fn new(format: ObjectFormat, object_type: ObjectType, data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        let hash = hash_object(format, object_type, &data);
        Self {
            hash,
            object_type,
            data,
        }
    }

    /// Build an object whose hash is already known.
    pub fn with_hash(hash: ObjectHash, object_type: ObjectType, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            hash,
            object_type,
            data: data.into(),
        }
    }

    pub fn hash(&self) -> ObjectHash {
        self.hash
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the body.
    pub fn shared_data(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    /// Inflated size in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Recompute the hash from the body and compare it with the stored one.
    pub fn verify(&self) -> bool {
        hash_object(self.hash.format(), self.object_type, &self.data) == self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_code_roundtrip() {
        for t in [
            ObjectType::Commit,
            ObjectType::Tree,
            ObjectType::Blob,
            ObjectType::Tag,
            ObjectType::OfsDelta,
            ObjectType::RefDelta,
        ] {
            assert_eq!(ObjectType::from_pack_code(t.pack_code()), Some(t));
        }
    }

    #[test]
    fn unknown_pack_codes() {
        assert!(ObjectType::from_pack_code(0).is_none());
        assert!(ObjectType::from_pack_code(5).is_none());
        assert!(ObjectType::from_pack_code(8).is_none());
    }

    #[test]
    fn display_and_parse() {
        assert_eq!(ObjectType::Blob.to_string(), "blob");
        assert_eq!("commit".parse::<ObjectType>().unwrap(), ObjectType::Commit);
        assert!(matches!(
            "snapshot".parse::<ObjectType>(),
            Err(TypeError::UnknownObjectType(_))
        ));
    }

    #[test]
    fn matches_any() {
        assert!(ObjectType::Blob.matches(ObjectType::Any));
        assert!(ObjectType::Blob.matches(ObjectType::Blob));
        assert!(!ObjectType::Blob.matches(ObjectType::Tree));
    }

    #[test]
    fn delta_classification() {
        assert!(ObjectType::OfsDelta.is_delta());
        assert!(ObjectType::RefDelta.is_delta());
        assert!(!ObjectType::Tag.is_delta());
        assert!(ObjectType::Tag.is_full());
        assert!(!ObjectType::Any.is_full());
    }

    #[test]
    fn encoded_object_hash_is_deterministic() {
        let a = EncodedObject::new(ObjectFormat::Sha1, ObjectType::Blob, b"hello".to_vec());
        let b = EncodedObject::new(ObjectFormat::Sha1, ObjectType::Blob, b"hello".to_vec());
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.size(), 5);
        assert!(a.verify());
    }

    #[test]
    fn verify_detects_wrong_hash() {
        let obj = EncodedObject::with_hash(
            ObjectHash::zero(ObjectFormat::Sha1),
            ObjectType::Blob,
            b"x".to_vec(),
        );
        assert!(!obj.verify());
    }
}
