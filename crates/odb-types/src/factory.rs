use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hash::{ObjectFormat, ObjectHash};
use crate::hasher::Hasher;

/// How hex input shorter than a full digest is treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HexPrefixPolicy {
    /// Only full-width hex digests are accepted.
    #[default]
    Strict,
    /// Even-length hex shorter than 40 characters is accepted and
    /// zero-padded into a 20-byte digest.
    LegacyShort,
}

/// Capability that fixes the digest width of every component built from it.
///
/// Components receive a factory at construction time instead of consulting
/// any process-wide registry. A custom algorithm setup is a different
/// implementation of this trait.
pub trait HashFactory: Send + Sync + fmt::Debug {
    fn format(&self) -> ObjectFormat;

    fn prefix_policy(&self) -> HexPrefixPolicy {
        HexPrefixPolicy::Strict
    }

    /// A fresh streaming hasher of this family.
    fn hasher(&self) -> Hasher {
        Hasher::new(self.format())
    }

    fn size(&self) -> usize {
        self.format().size()
    }

    fn hex_size(&self) -> usize {
        self.format().hex_size()
    }

    fn zero(&self) -> ObjectHash {
        ObjectHash::zero(self.format())
    }

    /// Read a digest from the first `size()` bytes of `bytes`.
    fn from_bytes(&self, bytes: &[u8]) -> Option<ObjectHash> {
        ObjectHash::from_prefix_of(self.format(), bytes)
    }

    /// Parse a hex digest of this family, honoring the prefix policy.
    fn from_hex(&self, s: &str) -> Option<ObjectHash> {
        if s.len() == self.hex_size() {
            return ObjectHash::from_hex(s).filter(|h| h.format() == self.format());
        }
        match self.prefix_policy() {
            HexPrefixPolicy::Strict => None,
            HexPrefixPolicy::LegacyShort => {
                if s.len() >= ObjectFormat::Sha1.hex_size() || s.len() % 2 != 0 {
                    return None;
                }
                let bytes = hex::decode(s).ok()?;
                let mut out = [0u8; 20];
                out[..bytes.len()].copy_from_slice(&bytes);
                Some(ObjectHash::Sha1(out))
            }
        }
    }
}

/// Shared handle to a factory.
pub type SharedFactory = Arc<dyn HashFactory>;

/// Factory for 20-byte digests.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha1Factory {
    pub policy: HexPrefixPolicy,
}

impl HashFactory for Sha1Factory {
    fn format(&self) -> ObjectFormat {
        ObjectFormat::Sha1
    }

    fn prefix_policy(&self) -> HexPrefixPolicy {
        self.policy
    }
}

/// Factory for 32-byte digests. Short hex input is never accepted.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Factory;

impl HashFactory for Sha256Factory {
    fn format(&self) -> ObjectFormat {
        ObjectFormat::Sha256
    }
}

/// Build the stock factory for a format.
pub fn factory_for(format: ObjectFormat, policy: HexPrefixPolicy) -> SharedFactory {
    match format {
        ObjectFormat::Sha1 => Arc::new(Sha1Factory { policy }),
        ObjectFormat::Sha256 => Arc::new(Sha256Factory),
    }
}

/// The 20-byte factory, used whenever the width cannot be inferred.
pub fn default_factory() -> SharedFactory {
    factory_for(ObjectFormat::Sha1, HexPrefixPolicy::Strict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_sha1() {
        let f = default_factory();
        assert_eq!(f.format(), ObjectFormat::Sha1);
        assert_eq!(f.size(), 20);
        assert_eq!(f.zero(), ObjectHash::zero(ObjectFormat::Sha1));
    }

    #[test]
    fn from_hex_rejects_other_width() {
        let sha1 = default_factory();
        let long = "0d8d657df872bef9d0684fe4bc4ee3a088b6f0f72d64f951daff9465068905ac";
        assert!(sha1.from_hex(long).is_none());
        assert!(Sha256Factory.from_hex(long).is_some());
        assert!(Sha256Factory.from_hex("1669dce138d9b841a518c64b10914d88f5e488ea").is_none());
    }

    #[test]
    fn strict_policy_rejects_prefix() {
        assert!(default_factory().from_hex("1669dce1").is_none());
    }

    #[test]
    fn legacy_policy_pads_prefix() {
        let f = Sha1Factory {
            policy: HexPrefixPolicy::LegacyShort,
        };
        let h = f.from_hex("1669dce1").unwrap();
        assert_eq!(h.to_hex(), format!("1669dce1{}", "0".repeat(32)));
        assert!(f.from_hex("1669d").is_none());
        assert!(f.from_hex("zz").is_none());
    }

    #[test]
    fn sha256_never_accepts_prefix() {
        assert!(Sha256Factory.from_hex("1669dce1").is_none());
    }

    #[test]
    fn from_bytes_reads_leading_digest() {
        let f = factory_for(ObjectFormat::Sha256, HexPrefixPolicy::Strict);
        let mut buf = vec![9u8; 32];
        buf.extend_from_slice(&[1, 2, 3]);
        assert_eq!(f.from_bytes(&buf), Some(ObjectHash::from([9u8; 32])));
        assert!(f.from_bytes(&buf[..10]).is_none());
    }
}
