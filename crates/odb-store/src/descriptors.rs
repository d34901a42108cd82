use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use odb_pack::Packfile;
use odb_types::ObjectHash;
use tracing::debug;

use crate::error::StoreResult;

/// How long opened pack files stay open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorMode {
    /// Every opened pack stays open until the store is closed.
    KeepAll,
    /// At most this many packs stay open; the oldest is closed first.
    Bounded(usize),
    /// Each pack is opened for one request and closed right after.
    PerRequest,
}

/// Where a pack's descriptor currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorState {
    Closed,
    /// Open and held by the pool.
    OpenTracked,
    /// Open for a single request only.
    OpenUntracked,
}

pub(crate) type SharedPackfile = Arc<Mutex<Packfile>>;

/// A pack handle for one request.
pub(crate) enum PackHandle {
    Tracked(SharedPackfile),
    Untracked(Packfile),
}

impl PackHandle {
    pub fn with<T>(self, f: impl FnOnce(&mut Packfile) -> StoreResult<T>) -> StoreResult<T> {
        match self {
            Self::Tracked(shared) => {
                let mut pack = shared.lock().expect("lock poisoned");
                f(&mut pack)
            }
            Self::Untracked(mut pack) => {
                let result = f(&mut pack);
                drop(pack.close());
                result
            }
        }
    }
}

/// Open pack files, keyed by pack checksum.
pub(crate) struct DescriptorPool {
    mode: DescriptorMode,
    open: HashMap<ObjectHash, SharedPackfile>,
    /// Admission order, oldest first.
    order: VecDeque<ObjectHash>,
    untracked: HashMap<ObjectHash, usize>,
    /// Pack files opened so far, tracked or not.
    opened: u64,
}

impl DescriptorPool {
    pub fn new(mode: DescriptorMode) -> Self {
        Self {
            mode,
            open: HashMap::new(),
            order: VecDeque::new(),
            untracked: HashMap::new(),
            opened: 0,
        }
    }

    pub fn mode(&self) -> DescriptorMode {
        self.mode
    }

    /// A handle on the pack named `checksum`, opening it with `open` when
    /// the pool does not hold it yet.
    pub fn acquire(
        &mut self,
        checksum: ObjectHash,
        open: impl FnOnce() -> StoreResult<Packfile>,
    ) -> StoreResult<PackHandle> {
        if let Some(shared) = self.open.get(&checksum) {
            return Ok(PackHandle::Tracked(Arc::clone(shared)));
        }
        let pack = open()?;
        self.opened += 1;
        let limit = match self.mode {
            DescriptorMode::PerRequest => return Ok(PackHandle::Untracked(pack)),
            DescriptorMode::KeepAll => usize::MAX,
            DescriptorMode::Bounded(limit) => limit,
        };
        while self.open.len() >= limit {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.close_one(&oldest);
            debug!(pack = %oldest, "closed pack descriptor on pool overflow");
        }
        let shared = Arc::new(Mutex::new(pack));
        self.open.insert(checksum, Arc::clone(&shared));
        self.order.push_back(checksum);
        Ok(PackHandle::Tracked(shared))
    }

    /// Record that an untracked handle is in use, for [`state`](Self::state).
    pub fn mark_untracked(&mut self, checksum: ObjectHash, open: bool) {
        let count = self.untracked.entry(checksum).or_default();
        if open {
            *count += 1;
        } else {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.untracked.remove(&checksum);
            }
        }
    }

    pub fn state(&self, checksum: &ObjectHash) -> DescriptorState {
        if self.open.contains_key(checksum) {
            DescriptorState::OpenTracked
        } else if self.untracked.contains_key(checksum) {
            DescriptorState::OpenUntracked
        } else {
            DescriptorState::Closed
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn opened(&self) -> u64 {
        self.opened
    }

    /// Close and drop the pack named `checksum`, if the pool holds it.
    pub fn forget(&mut self, checksum: &ObjectHash) {
        self.order.retain(|c| c != checksum);
        self.close_one(checksum);
    }

    /// Close every tracked descriptor.
    pub fn close_all(&mut self) {
        let count = self.open.len();
        for checksum in std::mem::take(&mut self.order) {
            self.close_one(&checksum);
        }
        self.open.clear();
        if count > 0 {
            debug!(count, "closed pack descriptors");
        }
    }

    fn close_one(&mut self, checksum: &ObjectHash) {
        // A request still holding the handle closes it when it finishes.
        if let Some(shared) = self.open.remove(checksum) {
            if let Ok(mutex) = Arc::try_unwrap(shared) {
                if let Ok(pack) = mutex.into_inner() {
                    drop(pack.close());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    use odb_index::{IndexWriter, PackIndex};
    use odb_pack::{PackEncoder, PackPlan, Parser};
    use odb_types::{default_factory, EncodedObject, ObjectFormat, ObjectType};

    /// Writes a one-object pack and returns its checksum and index.
    fn write_pack(dir: &std::path::Path, content: &[u8]) -> (ObjectHash, Arc<PackIndex>) {
        let mut plan = PackPlan::new();
        plan.push(EncodedObject::new(ObjectFormat::Sha1, ObjectType::Blob, content.to_vec()));
        let mut encoder = PackEncoder::new(Vec::new(), ObjectFormat::Sha1);
        let checksum = encoder.encode_plan(&mut plan).unwrap();
        let bytes = encoder.into_inner();

        let mut writer = IndexWriter::new(default_factory());
        Parser::new(bytes.as_slice(), ObjectFormat::Sha1)
            .with_observer(&mut writer)
            .parse()
            .unwrap();
        let path = dir.join(format!("{checksum}.pack"));
        fs::File::create(&path).unwrap().write_all(&bytes).unwrap();
        (checksum, writer.index().unwrap())
    }

    fn opener(
        dir: &std::path::Path,
        checksum: ObjectHash,
        index: &Arc<PackIndex>,
    ) -> impl FnOnce() -> StoreResult<Packfile> {
        let path = dir.join(format!("{checksum}.pack"));
        let index = Arc::clone(index);
        move || Ok(Packfile::open(&path, index)?)
    }

    #[test]
    fn bounded_pool_evicts_oldest() {
        let tmp = tempfile::tempdir().unwrap();
        let packs: Vec<_> = (0..3)
            .map(|i| write_pack(tmp.path(), format!("pack {i}").as_bytes()))
            .collect();

        let mut pool = DescriptorPool::new(DescriptorMode::Bounded(2));
        for (checksum, index) in &packs {
            pool.acquire(*checksum, opener(tmp.path(), *checksum, index))
                .unwrap();
        }
        assert_eq!(pool.open_count(), 2);
        assert_eq!(pool.state(&packs[0].0), DescriptorState::Closed);
        assert_eq!(pool.state(&packs[1].0), DescriptorState::OpenTracked);
        assert_eq!(pool.state(&packs[2].0), DescriptorState::OpenTracked);

        // Reacquiring a pooled pack does not reopen it.
        let (checksum, _) = &packs[1];
        pool.acquire(*checksum, || panic!("pack was reopened")).unwrap();
    }

    #[test]
    fn forgotten_pack_is_reopened() {
        let tmp = tempfile::tempdir().unwrap();
        let (checksum, index) = write_pack(tmp.path(), b"forget me");
        let mut pool = DescriptorPool::new(DescriptorMode::Bounded(1));
        pool.acquire(checksum, opener(tmp.path(), checksum, &index))
            .unwrap();
        pool.forget(&checksum);
        assert_eq!(pool.state(&checksum), DescriptorState::Closed);

        // The freed slot takes a new pack without evicting anything stale.
        let (other, other_index) = write_pack(tmp.path(), b"next");
        pool.acquire(other, opener(tmp.path(), other, &other_index))
            .unwrap();
        pool.acquire(checksum, opener(tmp.path(), checksum, &index))
            .unwrap();
        assert_eq!(pool.opened(), 3);
        assert_eq!(pool.open_count(), 1);
        assert_eq!(pool.state(&checksum), DescriptorState::OpenTracked);
    }

    #[test]
    fn keep_all_never_evicts() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = DescriptorPool::new(DescriptorMode::KeepAll);
        for i in 0..4 {
            let (checksum, index) = write_pack(tmp.path(), format!("keep {i}").as_bytes());
            pool.acquire(checksum, opener(tmp.path(), checksum, &index))
                .unwrap();
        }
        assert_eq!(pool.open_count(), 4);
        pool.close_all();
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn per_request_handles_are_untracked() {
        let tmp = tempfile::tempdir().unwrap();
        let (checksum, index) = write_pack(tmp.path(), b"once");
        let mut pool = DescriptorPool::new(DescriptorMode::PerRequest);
        let handle = pool
            .acquire(checksum, opener(tmp.path(), checksum, &index))
            .unwrap();
        assert!(matches!(handle, PackHandle::Untracked(_)));
        assert_eq!(pool.open_count(), 0);

        let hash = index.entries().next().unwrap().hash;
        pool.mark_untracked(checksum, true);
        assert_eq!(pool.state(&checksum), DescriptorState::OpenUntracked);
        let size = handle
            .with(|pack| {
                let offset = pack.find_offset(&hash).unwrap();
                Ok(pack.size_at(offset)?)
            })
            .unwrap();
        pool.mark_untracked(checksum, false);
        assert_eq!(size, 4);
        assert_eq!(pool.state(&checksum), DescriptorState::Closed);
    }
}
