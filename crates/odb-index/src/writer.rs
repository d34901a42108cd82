use std::sync::Arc;

use odb_types::{ObjectHash, SharedFactory};
use tracing::{debug, trace};

use crate::entry::Entry;
use crate::error::{IndexError, IndexResult};
use crate::memory::{PackIndex, Tables};

/// Builds a [`PackIndex`] while a pack is being parsed.
///
/// Driven by the pack parser: one [`on_header`], one
/// [`on_inflated_object_content`] per resolved object, then [`on_footer`].
/// The index handle is available from the start, but stays incomplete (and
/// refuses to be encoded) until the footer arrives.
///
/// [`on_header`]: IndexWriter::on_header
/// [`on_inflated_object_content`]: IndexWriter::on_inflated_object_content
/// [`on_footer`]: IndexWriter::on_footer
#[derive(Debug)]
pub struct IndexWriter {
    factory: SharedFactory,
    index: Arc<PackIndex>,
    expected: Option<u32>,
    entries: Vec<Entry>,
    deltas: usize,
    finished: bool,
}

impl IndexWriter {
    pub fn new(factory: SharedFactory) -> Self {
        let index = Arc::new(PackIndex::empty(factory.clone()));
        Self {
            factory,
            index,
            expected: None,
            entries: Vec::new(),
            deltas: 0,
            finished: false,
        }
    }

    /// The index being built. Queries see an empty index until the footer.
    pub fn handle(&self) -> Arc<PackIndex> {
        self.index.clone()
    }

    pub fn on_header(&mut self, count: u32) -> IndexResult<()> {
        if self.expected.is_some() {
            return Err(IndexError::Corrupted("pack header seen twice".into()));
        }
        self.expected = Some(count);
        self.entries.reserve(count as usize);
        Ok(())
    }

    /// Record one object. `base_offset` is the pack offset of the delta base
    /// the object was reconstructed from, if any.
    pub fn on_inflated_object_content(
        &mut self,
        hash: ObjectHash,
        offset: u64,
        crc32: u32,
        base_offset: Option<u64>,
    ) -> IndexResult<()> {
        if self.finished {
            return Err(IndexError::Corrupted("object reported after pack footer".into()));
        }
        if hash.format() != self.factory.format() {
            return Err(IndexError::Corrupted(format!(
                "object {hash} does not match index format {}",
                self.factory.format()
            )));
        }
        if let Some(base) = base_offset {
            trace!(%hash, offset, base, "indexed delta object");
            self.deltas += 1;
        }
        self.entries.push(Entry { hash, crc32, offset });
        Ok(())
    }

    /// Finalize the index with the pack trailer checksum.
    pub fn on_footer(&mut self, checksum: ObjectHash) -> IndexResult<()> {
        if self.finished {
            return Err(IndexError::Corrupted("pack footer seen twice".into()));
        }
        if let Some(expected) = self.expected {
            if expected as usize != self.entries.len() {
                return Err(IndexError::Corrupted(format!(
                    "pack header announced {expected} objects, saw {}",
                    self.entries.len()
                )));
            }
        }

        let guard = self.index.begin_build()?;
        let entries = std::mem::take(&mut self.entries);
        let count = entries.len();
        guard.finish(Tables::from_entries(self.factory.format(), entries, checksum));
        self.finished = true;

        debug!(count, deltas = self.deltas, pack = %checksum, "built pack index");
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The finished index.
    pub fn index(&self) -> IndexResult<Arc<PackIndex>> {
        if !self.finished {
            return Err(IndexError::Incomplete);
        }
        Ok(self.index.clone())
    }
}
