use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;

/// Digest family used to name objects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectFormat {
    /// 20-byte digests.
    #[default]
    Sha1,
    /// 32-byte digests.
    Sha256,
}

impl ObjectFormat {
    /// Raw digest width in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Digest width in hex characters.
    pub const fn hex_size(self) -> usize {
        self.size() * 2
    }

    /// Infer the format from a raw digest width.
    pub fn from_size(size: usize) -> Option<Self> {
        match size {
            20 => Some(Self::Sha1),
            32 => Some(Self::Sha256),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1 => write!(f, "sha1"),
            Self::Sha256 => write!(f, "sha256"),
        }
    }
}

impl FromStr for ObjectFormat {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            other => Err(TypeError::UnknownFormat(other.to_string())),
        }
    }
}

/// Content digest naming an immutable object.
///
/// A closed sum over the two supported widths, so comparisons on the hot
/// lookup paths never go through dynamic dispatch. Ordering is lexicographic
/// over the raw bytes; equality is byte-wise. The all-zero value of either
/// width means "absent".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectHash {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl ObjectHash {
    /// The zero hash for a format.
    pub const fn zero(format: ObjectFormat) -> Self {
        match format {
            ObjectFormat::Sha1 => Self::Sha1([0u8; 20]),
            ObjectFormat::Sha256 => Self::Sha256([0u8; 32]),
        }
    }

    /// Build a hash from raw bytes, inferring the width from the length.
    ///
    /// Returns `None` unless `bytes` is exactly 20 or 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            20 => {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(bytes);
                Some(Self::Sha1(arr))
            }
            32 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                Some(Self::Sha256(arr))
            }
            _ => None,
        }
    }

    /// Build a hash of the given format from the first `format.size()` bytes.
    pub fn from_prefix_of(format: ObjectFormat, bytes: &[u8]) -> Option<Self> {
        bytes.get(..format.size()).and_then(Self::from_bytes)
    }

    /// Parse exactly 40 or 64 hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        let format = match s.len() {
            40 => ObjectFormat::Sha1,
            64 => ObjectFormat::Sha256,
            _ => return None,
        };
        let mut hash = Self::zero(format);
        hex::decode_to_slice(s, hash.as_bytes_mut()).ok()?;
        Some(hash)
    }

    pub fn format(&self) -> ObjectFormat {
        match self {
            Self::Sha1(_) => ObjectFormat::Sha1,
            Self::Sha256(_) => ObjectFormat::Sha256,
        }
    }

    /// Digest width in bytes (20 or 32).
    pub fn size(&self) -> usize {
        self.format().size()
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(b) => b,
            Self::Sha256(b) => b,
        }
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Sha1(b) => b,
            Self::Sha256(b) => b,
        }
    }

    /// Compare the digest against raw bytes.
    pub fn compare(&self, other: &[u8]) -> Ordering {
        self.as_bytes().cmp(other)
    }

    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.as_bytes().starts_with(prefix)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.as_bytes()[..4])
    }
}

impl PartialOrd for ObjectHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectHash {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", self.short_hex())
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectHash {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s).ok_or_else(|| TypeError::InvalidHex(s.to_string()))
    }
}

impl From<[u8; 20]> for ObjectHash {
    fn from(bytes: [u8; 20]) -> Self {
        Self::Sha1(bytes)
    }
}

impl From<[u8; 32]> for ObjectHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self::Sha256(bytes)
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Serialize for ObjectHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
