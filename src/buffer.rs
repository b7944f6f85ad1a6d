//! Sharded, size-classed pool of reusable byte buffers.
//!
//! Grounded on the adaptive buffer sizing in hyper's `proto::h1::io::Buffered`:
//! rather than letting every connection allocate and drop its own read/write
//! buffers, leases are bucketed into power-of-two size classes and recycled.
//! Each class has its own free-list lock so connections acquiring
//! differently-sized buffers never contend with each other.

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

const MIN_CLASS_SHIFT: u32 = 10; // 1 KiB
const NUM_CLASSES: usize = 8; // 1 KiB .. 128 KiB

/// A pool of reusable [`BytesMut`] buffers, bucketed by power-of-two size.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

struct Inner {
    classes: [Mutex<Vec<BytesMut>>; NUM_CLASSES],
    max_per_class: usize,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_per_class", &self.inner.max_per_class)
            .finish()
    }
}

impl BufferPool {
    /// Create a pool that will hold at most `max_per_class` idle buffers per
    /// size class before discarding returns.
    pub fn new(max_per_class: usize) -> BufferPool {
        BufferPool {
            inner: Arc::new(Inner {
                classes: Default::default(),
                max_per_class,
            }),
        }
    }

    /// Lease a buffer with at least `capacity` bytes of headroom.
    pub fn acquire(&self, capacity: usize) -> PooledBuf {
        let class = class_for(capacity);
        let cap = class_capacity(class);
        let buf = if let Some(class_lock) = self.inner.classes.get(class) {
            let mut free = class_lock.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        } else {
            None
        };
        let buf = buf.unwrap_or_else(|| BytesMut::with_capacity(cap));
        PooledBuf {
            buf: Some(buf),
            class,
            pool: self.clone(),
        }
    }

    fn release(&self, class: usize, mut buf: BytesMut) {
        if class >= NUM_CLASSES {
            return; // oversize lease, let it drop
        }
        buf.clear();
        let mut free = self.inner.classes[class]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if free.len() < self.inner.max_per_class {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> BufferPool {
        BufferPool::new(64)
    }
}

fn class_for(capacity: usize) -> usize {
    let mut shift = MIN_CLASS_SHIFT;
    let mut class = 0;
    while (1usize << shift) < capacity && class + 1 < NUM_CLASSES {
        shift += 1;
        class += 1;
    }
    if (1usize << shift) < capacity {
        NUM_CLASSES // signals "too big to pool"
    } else {
        class
    }
}

fn class_capacity(class: usize) -> usize {
    1usize << (MIN_CLASS_SHIFT + class as u32)
}

/// An RAII guard around a leased [`BytesMut`], returned to its pool's
/// free list on drop.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    class: usize,
    pool: BufferPool,
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.as_ref().map(BytesMut::len).unwrap_or(0))
            .field("class", &self.class)
            .finish()
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(self.class, buf);
        }
    }
}
