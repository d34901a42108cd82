use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Shared pool of reusable byte buffers.
///
/// Buffers come back emptied but not zeroed: their length is reset, their
/// capacity and old contents stay.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_pooled: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            max_pooled,
            free: Mutex::new(Vec::new()),
        })
    }

    /// Capacity of freshly allocated buffers.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take an empty buffer.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .expect("lock poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().expect("lock poisoned").len()
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock().expect("lock poisoned");
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`], returned when dropped.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused_with_reset_length() {
        let pool = BufferPool::new(64, 4);
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"leftover");
            assert_eq!(buf.len(), 8);
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = BufferPool::new(8, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.get()).collect();
        drop(bufs);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn buffers_cross_threads() {
        let pool = BufferPool::new(16, 4);
        let mut buf = pool.get();
        buf.push(7);
        std::thread::spawn(move || assert_eq!(buf[0], 7))
            .join()
            .expect("thread should not panic");
        assert_eq!(pool.idle(), 1);
    }
}
