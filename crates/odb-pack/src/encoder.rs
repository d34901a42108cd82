use std::collections::HashMap;
use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use odb_index::Entry;
use odb_types::{EncodedObject, Hasher, ObjectFormat, ObjectHash, ObjectType};
use tracing::{debug, trace};

use crate::delta::encode_delta;
use crate::error::{PackError, PackResult};
use crate::header::{encode_entry_head, encode_ofs, encode_pack_header};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteState {
    Unvisited,
    Pending,
    Written,
}

/// One object scheduled for a pack, optionally as a delta against another
/// entry of the same plan.
#[derive(Debug)]
pub struct ObjectToPack {
    object: EncodedObject,
    base: Option<usize>,
    delta: Option<Vec<u8>>,
    state: WriteState,
    offset: u64,
    crc32: u32,
}

impl ObjectToPack {
    fn new(object: EncodedObject) -> Self {
        Self {
            object,
            base: None,
            delta: None,
            state: WriteState::Unvisited,
            offset: 0,
            crc32: 0,
        }
    }

    pub fn hash(&self) -> ObjectHash {
        self.object.hash()
    }

    pub fn object(&self) -> &EncodedObject {
        &self.object
    }

    /// Plan position of the delta base, if this entry is a delta.
    pub fn base(&self) -> Option<usize> {
        self.base
    }

    pub fn is_delta(&self) -> bool {
        self.base.is_some()
    }

    pub fn is_written(&self) -> bool {
        self.state == WriteState::Written
    }

    /// Pack offset, valid once written.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Drop the delta and write the original object instead.
    fn demote(&mut self) {
        self.base = None;
        self.delta = None;
    }
}

/// The objects of one pack, in write order, with their delta choices.
#[derive(Debug, Default)]
pub struct PackPlan {
    objects: Vec<ObjectToPack>,
    positions: HashMap<ObjectHash, usize>,
}

impl PackPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object, returning its position. Adding a hash twice returns
    /// the first position.
    pub fn push(&mut self, object: EncodedObject) -> usize {
        if let Some(&pos) = self.positions.get(&object.hash()) {
            return pos;
        }
        let pos = self.objects.len();
        self.positions.insert(object.hash(), pos);
        self.objects.push(ObjectToPack::new(object));
        pos
    }

    /// Store `target` as `delta` against `base`.
    pub fn set_delta(&mut self, target: usize, base: usize, delta: Vec<u8>) -> PackResult<()> {
        if target == base || target >= self.objects.len() || base >= self.objects.len() {
            return Err(PackError::InvalidDelta(format!(
                "cannot delta entry {target} against entry {base}"
            )));
        }
        let entry = &mut self.objects[target];
        entry.base = Some(base);
        entry.delta = Some(delta);
        Ok(())
    }

    pub fn position(&self, hash: &ObjectHash) -> Option<usize> {
        self.positions.get(hash).copied()
    }

    pub fn get(&self, pos: usize) -> Option<&ObjectToPack> {
        self.objects.get(pos)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectToPack> {
        self.objects.iter()
    }
}

/// Chooses which objects go into a pack and which are stored as deltas.
pub trait DeltaSelector {
    fn objects_to_pack(&self, hashes: &[ObjectHash], window: usize) -> PackResult<PackPlan>;
}

/// Sliding-window selector: objects are sorted by type and descending
/// size, and each one is tried as a delta against the previous `window`
/// objects of the same type. A delta is kept when it is under half the
/// object's size.
pub struct WindowSelector<F> {
    lookup: F,
    max_depth: usize,
}

impl<F> WindowSelector<F>
where
    F: Fn(&ObjectHash) -> PackResult<EncodedObject>,
{
    pub fn new(lookup: F) -> Self {
        Self {
            lookup,
            max_depth: 50,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

impl<F> DeltaSelector for WindowSelector<F>
where
    F: Fn(&ObjectHash) -> PackResult<EncodedObject>,
{
    fn objects_to_pack(&self, hashes: &[ObjectHash], window: usize) -> PackResult<PackPlan> {
        let mut plan = PackPlan::new();
        for hash in hashes {
            let object = (self.lookup)(hash)?;
            if !object.object_type().is_full() {
                return Err(PackError::InvalidDelta(format!(
                    "{hash} is stored as {}, not a full object",
                    object.object_type()
                )));
            }
            plan.push(object);
        }
        if window == 0 || plan.len() < 2 {
            return Ok(plan);
        }

        let mut order: Vec<usize> = (0..plan.len()).collect();
        order.sort_by(|&a, &b| {
            let (a, b) = (&plan.objects[a].object, &plan.objects[b].object);
            a.object_type()
                .pack_code()
                .cmp(&b.object_type().pack_code())
                .then(b.size().cmp(&a.size()))
        });

        let mut depth = vec![0usize; plan.len()];
        for k in 1..order.len() {
            let target = order[k];
            let target_obj = &plan.objects[target].object;
            let mut best: Option<(usize, Vec<u8>)> = None;
            for &candidate in order[k.saturating_sub(window)..k].iter().rev() {
                let base_obj = &plan.objects[candidate].object;
                if base_obj.object_type() != target_obj.object_type()
                    || depth[candidate] >= self.max_depth
                {
                    continue;
                }
                let delta = encode_delta(base_obj.data(), target_obj.data());
                if best.as_ref().map_or(true, |(_, d)| delta.len() < d.len()) {
                    best = Some((candidate, delta));
                }
            }
            if let Some((base, delta)) = best {
                if (delta.len() as u64) < target_obj.size() / 2 {
                    depth[target] = depth[base] + 1;
                    plan.set_delta(target, base, delta)?;
                }
            }
        }
        Ok(plan)
    }
}

/// Counts and digests everything written through it.
struct CountingWriter<W> {
    inner: W,
    count: u64,
    hasher: Hasher,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Writes packs.
///
/// Bases are always written before the deltas that use them, and an entry
/// reached again through its own delta chain is written as a full object.
pub struct PackEncoder<W> {
    out: CountingWriter<W>,
    format: ObjectFormat,
    ref_deltas: bool,
    compression: Compression,
    entries: Vec<Entry>,
}

impl<W: Write> PackEncoder<W> {
    pub fn new(writer: W, format: ObjectFormat) -> Self {
        Self {
            out: CountingWriter {
                inner: writer,
                count: 0,
                hasher: Hasher::new(format),
            },
            format,
            ref_deltas: false,
            compression: Compression::default(),
            entries: Vec::new(),
        }
    }

    /// Name delta bases by hash instead of by relative offset.
    pub fn with_ref_deltas(mut self, ref_deltas: bool) -> Self {
        self.ref_deltas = ref_deltas;
        self
    }

    pub fn with_compression(mut self, level: u32) -> Self {
        self.compression = Compression::new(level);
        self
    }

    /// Let `selector` pick the pack contents, then write them. Returns the
    /// pack checksum.
    pub fn encode(
        &mut self,
        hashes: &[ObjectHash],
        window: usize,
        selector: &dyn DeltaSelector,
    ) -> PackResult<ObjectHash> {
        let mut plan = selector.objects_to_pack(hashes, window)?;
        self.encode_plan(&mut plan)
    }

    /// Write one complete pack for `plan`. Returns the pack checksum.
    pub fn encode_plan(&mut self, plan: &mut PackPlan) -> PackResult<ObjectHash> {
        self.out.count = 0;
        self.out.hasher = Hasher::new(self.format);
        self.entries.clear();

        let count = u32::try_from(plan.len()).map_err(|_| {
            PackError::InvalidDelta(format!("{} objects do not fit one pack", plan.len()))
        })?;
        self.out.write_all(&encode_pack_header(count))?;
        for pos in 0..plan.len() {
            self.write_entry(plan, pos)?;
        }

        let checksum = self.out.hasher.sum();
        self.out.inner.write_all(checksum.as_bytes())?;
        self.out.inner.flush()?;

        debug!(
            objects = count,
            deltas = plan.iter().filter(|o| o.is_delta()).count(),
            bytes = self.out.count + checksum.size() as u64,
            %checksum,
            "encoded pack"
        );
        Ok(checksum)
    }

    fn write_entry(&mut self, plan: &mut PackPlan, pos: usize) -> PackResult<()> {
        if plan.objects[pos].state == WriteState::Pending {
            debug!(hash = %plan.objects[pos].hash(), "delta cycle, writing full object");
            plan.objects[pos].demote();
        }
        if plan.objects[pos].state == WriteState::Written {
            return Ok(());
        }
        plan.objects[pos].state = WriteState::Pending;

        if let Some(base) = plan.objects[pos].base {
            if plan.objects[base].state != WriteState::Written {
                self.write_entry(plan, base)?;
            }
        }
        // Re-entry through a cycle may already have written this entry.
        if plan.objects[pos].state == WriteState::Written {
            return Ok(());
        }

        let offset = self.out.count;
        let entry = &plan.objects[pos];
        let mut head = Vec::with_capacity(32);
        let body: &[u8] = match (entry.base, entry.delta.as_deref()) {
            (Some(base), Some(delta)) => {
                let base = &plan.objects[base];
                if self.ref_deltas {
                    encode_entry_head(&mut head, ObjectType::RefDelta, delta.len() as u64);
                    head.extend_from_slice(base.hash().as_bytes());
                } else {
                    let relative = offset as i64 - base.offset as i64;
                    if relative <= 0 {
                        return Err(PackError::InvalidDeltaOffset(relative));
                    }
                    encode_entry_head(&mut head, ObjectType::OfsDelta, delta.len() as u64);
                    encode_ofs(&mut head, relative as u64);
                }
                delta
            }
            _ => {
                encode_entry_head(&mut head, entry.object.object_type(), entry.object.size());
                entry.object.data()
            }
        };

        let mut zlib = ZlibEncoder::new(Vec::new(), self.compression);
        zlib.write_all(body)?;
        let compressed = zlib.finish()?;

        let mut crc = crc32fast::Hasher::new();
        crc.update(&head);
        crc.update(&compressed);
        let crc32 = crc.finalize();

        self.out.write_all(&head)?;
        self.out.write_all(&compressed)?;
        trace!(hash = %entry.hash(), offset, delta = entry.is_delta(), "wrote pack entry");

        self.entries.push(Entry {
            hash: entry.hash(),
            crc32,
            offset,
        });
        let entry = &mut plan.objects[pos];
        entry.state = WriteState::Written;
        entry.offset = offset;
        entry.crc32 = crc32;
        Ok(())
    }

    /// Index entries for the last encoded pack, in write order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn into_inner(self) -> W {
        self.out.inner
    }
}
