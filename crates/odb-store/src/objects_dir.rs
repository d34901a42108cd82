use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use odb_types::{ObjectFormat, ObjectHash};
use tempfile::NamedTempFile;

use crate::error::{IoResultExt, StoreResult};

/// Layout of an objects directory:
///
/// ```text
/// objects/
///   ab/cdef...             loose object, sharded by the first hex byte
///   pack/pack-<hex>.pack   pack file named by its checksum
///   pack/pack-<hex>.idx    its index
///   info/alternates        other objects directories, one per line
/// ```
#[derive(Clone, Debug)]
pub struct ObjectsDir {
    root: PathBuf,
}

impl ObjectsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pack_dir(&self) -> PathBuf {
        self.root.join("pack")
    }

    pub fn loose_path(&self, hash: &ObjectHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    pub fn pack_path(&self, checksum: &ObjectHash) -> PathBuf {
        self.pack_dir().join(format!("pack-{checksum}.pack"))
    }

    pub fn index_path(&self, checksum: &ObjectHash) -> PathBuf {
        self.pack_dir().join(format!("pack-{checksum}.idx"))
    }

    pub fn alternates_path(&self) -> PathBuf {
        self.root.join("info").join("alternates")
    }

    /// Checksums of every pack that has both its `.pack` and `.idx` file,
    /// sorted.
    pub fn pack_checksums(&self, format: ObjectFormat) -> StoreResult<Vec<ObjectHash>> {
        let dir = self.pack_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_path("list packs", dir),
        };

        let mut checksums = Vec::new();
        for entry in entries {
            let name = entry.with_path("list packs", &dir)?.file_name();
            let Some(hex) = name
                .to_str()
                .and_then(|n| n.strip_prefix("pack-"))
                .and_then(|n| n.strip_suffix(".pack"))
            else {
                continue;
            };
            let Some(checksum) = ObjectHash::from_hex(hex).filter(|h| h.format() == format) else {
                continue;
            };
            if self.index_path(&checksum).is_file() {
                checksums.push(checksum);
            }
        }
        checksums.sort();
        Ok(checksums)
    }

    /// Hashes of every loose object, sorted.
    pub fn loose_hashes(&self, format: ObjectFormat) -> StoreResult<Vec<ObjectHash>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_path("list objects", &self.root),
        };

        let mut hashes = Vec::new();
        for entry in entries {
            let entry = entry.with_path("list objects", &self.root)?;
            let shard = entry.file_name();
            let Some(shard) = shard.to_str().filter(|s| is_hex(s, 2)) else {
                continue;
            };
            let shard_path = entry.path();
            if !shard_path.is_dir() {
                continue;
            }
            for object in fs::read_dir(&shard_path).with_path("list objects", &shard_path)? {
                let name = object.with_path("list objects", &shard_path)?.file_name();
                let Some(rest) = name.to_str().filter(|s| is_hex(s, format.hex_size() - 2)) else {
                    continue;
                };
                if let Some(hash) = ObjectHash::from_hex(&format!("{shard}{rest}")) {
                    hashes.push(hash);
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Objects directories listed in `info/alternates`. Relative entries
    /// are resolved against this directory; blank lines and `#` comments
    /// are skipped.
    pub fn alternates(&self) -> StoreResult<Vec<PathBuf>> {
        let path = self.alternates_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_path("read alternates", path),
        };
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| {
                let p = Path::new(line);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    self.root.join(p)
                }
            })
            .collect())
    }

    /// A temporary file inside `dir`, removed on drop unless persisted.
    pub fn temp_file(&self, dir: &Path, prefix: &str) -> StoreResult<NamedTempFile> {
        fs::create_dir_all(dir).with_path("create directory", dir)?;
        tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(dir)
            .with_path("create temp file", dir)
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(hex: &str) -> ObjectHash {
        ObjectHash::from_hex(hex).unwrap()
    }

    #[test]
    fn loose_path_is_sharded() {
        let dir = ObjectsDir::new("/repo/objects");
        let h = hash("95d09f2b10159347eece71399a7e2e907ea3df4f");
        assert_eq!(
            dir.loose_path(&h),
            PathBuf::from("/repo/objects/95/d09f2b10159347eece71399a7e2e907ea3df4f")
        );
        assert_eq!(
            dir.pack_path(&h),
            PathBuf::from("/repo/objects/pack/pack-95d09f2b10159347eece71399a7e2e907ea3df4f.pack")
        );
    }

    #[test]
    fn missing_directories_are_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ObjectsDir::new(tmp.path().join("objects"));
        assert!(dir.loose_hashes(ObjectFormat::Sha1).unwrap().is_empty());
        assert!(dir.pack_checksums(ObjectFormat::Sha1).unwrap().is_empty());
        assert!(dir.alternates().unwrap().is_empty());
    }

    #[test]
    fn lists_loose_hashes_and_skips_junk() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ObjectsDir::new(tmp.path());
        let h = hash("95d09f2b10159347eece71399a7e2e907ea3df4f");
        let path = dir.loose_path(&h);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        fs::write(path.parent().unwrap().join("tmp_obj_123"), b"").unwrap();
        fs::create_dir_all(tmp.path().join("info")).unwrap();
        fs::create_dir_all(tmp.path().join("pack")).unwrap();

        assert_eq!(dir.loose_hashes(ObjectFormat::Sha1).unwrap(), vec![h]);
        assert!(dir.loose_hashes(ObjectFormat::Sha256).unwrap().is_empty());
    }

    #[test]
    fn pack_needs_its_index() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ObjectsDir::new(tmp.path());
        let a = hash("1111111111111111111111111111111111111111");
        let b = hash("2222222222222222222222222222222222222222");
        fs::create_dir_all(dir.pack_dir()).unwrap();
        fs::write(dir.pack_path(&a), b"").unwrap();
        fs::write(dir.index_path(&a), b"").unwrap();
        fs::write(dir.pack_path(&b), b"").unwrap();

        assert_eq!(dir.pack_checksums(ObjectFormat::Sha1).unwrap(), vec![a]);
    }

    #[test]
    fn reads_alternates() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ObjectsDir::new(tmp.path());
        fs::create_dir_all(tmp.path().join("info")).unwrap();
        fs::write(
            dir.alternates_path(),
            "/shared/objects\n\n# comment\n../other/objects\n",
        )
        .unwrap();

        assert_eq!(
            dir.alternates().unwrap(),
            vec![
                PathBuf::from("/shared/objects"),
                tmp.path().join("../other/objects"),
            ]
        );
    }
}
