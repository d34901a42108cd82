use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use odb_index::{IndexEncoder, IndexWriter, PackIndex};
use odb_pack::Parser;
use odb_types::{ObjectHash, SharedFactory};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::error::{IoResultExt, StoreError, StoreResult};
use crate::objects_dir::ObjectsDir;

/// Chunks in flight between the writer and the parser thread.
const CHANNEL_DEPTH: usize = 4;
const CHUNK_SIZE: usize = 32 * 1024;

type Notify = Box<dyn FnOnce(ObjectHash, Arc<PackIndex>) + Send>;

/// A pack that parsed cleanly and holds at least one object.
struct Parsed {
    temp: NamedTempFile,
    checksum: ObjectHash,
    index: Arc<PackIndex>,
}

/// Sink for raw pack bytes, typically straight from the network.
///
/// Bytes are spooled to a temporary file under `objects/pack` while a
/// background thread parses them and builds the index. Writes block once
/// the parser falls a few chunks behind. [`close`](PackWriter::close)
/// waits for the parser, then either moves `pack-<checksum>.pack` and its
/// `.idx` into place or, when the pack held no objects or failed to parse,
/// deletes the temporary file.
pub struct PackWriter {
    dir: ObjectsDir,
    sender: Option<SyncSender<PooledBuffer>>,
    worker: Option<JoinHandle<StoreResult<Option<Parsed>>>>,
    pool: Arc<BufferPool>,
    notify: Option<Notify>,
}

impl PackWriter {
    pub fn new(dir: &ObjectsDir, factory: SharedFactory) -> StoreResult<Self> {
        let pack_dir = dir.pack_dir();
        let temp = dir.temp_file(&pack_dir, "tmp_pack_")?;
        let tee = temp.as_file().try_clone().with_path("open temp pack", temp.path())?;

        let pool = BufferPool::new(CHUNK_SIZE, CHANNEL_DEPTH + 2);
        let (sender, receiver) = sync_channel(CHANNEL_DEPTH);
        let worker = thread::Builder::new()
            .name("pack-writer".into())
            .spawn(move || ingest(receiver, tee, temp, factory))
            .with_path("spawn pack parser", &pack_dir)?;

        Ok(Self {
            dir: dir.clone(),
            sender: Some(sender),
            worker: Some(worker),
            pool,
            notify: None,
        })
    }

    /// Called with the checksum and index of a persisted pack.
    pub fn with_notify(mut self, notify: impl FnOnce(ObjectHash, Arc<PackIndex>) + Send + 'static) -> Self {
        self.notify = Some(Box::new(notify));
        self
    }

    /// Wait for the parser and persist the pack. Returns the pack checksum,
    /// or `None` when there was nothing to persist.
    pub fn close(mut self) -> StoreResult<Option<ObjectHash>> {
        let Some(parsed) = self.join()? else {
            debug!("pack writer received no objects");
            return Ok(None);
        };
        let checksum = parsed.checksum;
        let count = parsed.index.count();
        let index = self.persist(parsed)?;
        info!(pack = %checksum, objects = count, "persisted pack");
        if let Some(notify) = self.notify.take() {
            notify(checksum, index);
        }
        Ok(Some(checksum))
    }

    fn join(&mut self) -> StoreResult<Option<Parsed>> {
        drop(self.sender.take());
        let Some(worker) = self.worker.take() else {
            return Ok(None);
        };
        worker.join().map_err(|_| StoreError::Io {
            op: "join pack parser",
            path: self.dir.pack_dir(),
            source: io::Error::other("pack parser panicked"),
        })?
    }

    fn persist(&self, parsed: Parsed) -> StoreResult<Arc<PackIndex>> {
        let pack_dir = self.dir.pack_dir();
        let idx_temp = self.dir.temp_file(&pack_dir, "tmp_idx_")?;
        {
            let mut out = BufWriter::new(idx_temp.as_file());
            IndexEncoder::new(&mut out).encode(&parsed.index)?;
            out.flush().with_path("write pack index", idx_temp.path())?;
        }

        let idx_path = self.dir.index_path(&parsed.checksum);
        idx_temp
            .persist(&idx_path)
            .map_err(|e| e.error)
            .with_path("persist pack index", &idx_path)?;
        let pack_path = self.dir.pack_path(&parsed.checksum);
        if let Err(e) = parsed.temp.persist(&pack_path) {
            // An index without its pack is never listed, but it would stay.
            if let Err(cleanup) = fs::remove_file(&idx_path) {
                warn!(path = %idx_path.display(), error = %cleanup, "could not remove orphan pack index");
            }
            return Err(e.error).with_path("persist pack", &pack_path);
        }
        Ok(parsed.index)
    }
}

impl Write for PackWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pack writer is closed"))?;
        for chunk in buf.chunks(CHUNK_SIZE) {
            let mut pooled = self.pool.get();
            pooled.extend_from_slice(chunk);
            sender
                .send(pooled)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pack parser stopped"))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PackWriter {
    fn drop(&mut self) {
        // Unclosed writers discard their temp file.
        let _ = self.join();
    }
}

/// Parser thread body.
fn ingest(
    receiver: Receiver<PooledBuffer>,
    tee: File,
    temp: NamedTempFile,
    factory: SharedFactory,
) -> StoreResult<Option<Parsed>> {
    let format = factory.format();
    let mut reader = ChannelReader {
        receiver,
        current: None,
        pos: 0,
        tee,
        received: 0,
    };
    let mut index_writer = IndexWriter::new(factory);
    let result = Parser::new(&mut reader, format)
        .with_pack_file(temp.path())
        .with_observer(&mut index_writer)
        .parse();
    reader.drain();

    if reader.received == 0 {
        return Ok(None);
    }
    let checksum = result?;
    let index = index_writer.index()?;
    if index.count() == 0 {
        return Ok(None);
    }
    Ok(Some(Parsed {
        temp,
        checksum,
        index,
    }))
}

/// Read side of the channel. Every chunk is copied to the temp pack as it
/// arrives, so the file is complete up to anything the parser has read.
struct ChannelReader {
    receiver: Receiver<PooledBuffer>,
    current: Option<PooledBuffer>,
    pos: usize,
    tee: File,
    received: u64,
}

impl ChannelReader {
    /// Discard whatever the writer still sends so it never blocks.
    fn drain(&mut self) {
        self.current = None;
        while self.receiver.recv().is_ok() {}
    }
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(chunk) = &self.current {
                if self.pos < chunk.len() {
                    let n = (chunk.len() - self.pos).min(out.len());
                    out[..n].copy_from_slice(&chunk[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
            }
            match self.receiver.recv() {
                Ok(chunk) => {
                    self.tee.write_all(&chunk)?;
                    self.received += chunk.len() as u64;
                    self.current = Some(chunk);
                    self.pos = 0;
                }
                Err(_) => {
                    self.current = None;
                    return Ok(0);
                }
            }
        }
    }
}
