use std::path::Path;

use odb_types::{factory_for, HexPrefixPolicy, ObjectFormat, SharedFactory};
use serde::{Deserialize, Serialize};

use crate::descriptors::DescriptorMode;
use crate::error::{IoResultExt, StoreResult};

/// Which source `get` consults first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LookupOrder {
    #[default]
    LooseFirst,
    PackedFirst,
}

/// Object store configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StoreOptions {
    pub object_format: ObjectFormat,
    /// Keep every opened pack open until `close`.
    pub keep_descriptors: bool,
    /// Size of the bounded pack descriptor pool; 0 disables it.
    pub max_open_descriptors: usize,
    pub lookup_order: LookupOrder,
    /// Objects larger than this many bytes are never cached. 0 disables
    /// the limit.
    pub large_object_threshold: u64,
    /// Byte capacity of the default content cache.
    pub cache_capacity: usize,
    pub max_alternate_depth: usize,
    pub hex_prefix_policy: HexPrefixPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            object_format: ObjectFormat::Sha1,
            keep_descriptors: false,
            max_open_descriptors: 0,
            lookup_order: LookupOrder::LooseFirst,
            large_object_threshold: 0,
            cache_capacity: 96 * 1024 * 1024,
            max_alternate_depth: 5,
            hex_prefix_policy: HexPrefixPolicy::Strict,
        }
    }
}

impl StoreOptions {
    /// Parse options from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path).with_path("read config", path)?;
        Self::from_toml_str(&content)
    }

    /// The hash factory every component of the store is built with.
    pub fn factory(&self) -> SharedFactory {
        factory_for(self.object_format, self.hex_prefix_policy)
    }

    pub fn descriptor_mode(&self) -> DescriptorMode {
        if self.keep_descriptors {
            DescriptorMode::KeepAll
        } else if self.max_open_descriptors > 0 {
            DescriptorMode::Bounded(self.max_open_descriptors)
        } else {
            DescriptorMode::PerRequest
        }
    }

    /// Whether an object of `size` bytes may enter the content cache.
    pub fn is_cacheable(&self, size: u64) -> bool {
        self.large_object_threshold == 0 || size <= self.large_object_threshold
    }
}
