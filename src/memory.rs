//! Reusable read buffers.
//!
//! A [`MemoryManager`] hands out zero-initialized [`BytesMut`] buffers whose
//! length is the writable capacity. After a read of `n` bytes the caller
//! slices the filled prefix off with [`MemoryManager::extract_and_recycle()`]
//! and the untouched remainder goes back to the pool for the next read. A
//! buffer is owned either by the pool or by exactly one caller.

use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::sync::Mutex;
use tracing::trace;

use crate::config::{DEFAULT_READ_BUFFER_MIN_SIZE, DEFAULT_READ_BUFFER_PREALLOCATION_SIZE};

const DEFAULT_SHARED_POOL_LIMIT: usize = 32;

/// Pool of reusable byte buffers.
pub trait MemoryManager {
    /// Returns a buffer of at least `min_size` writable bytes.
    fn acquire(&self, min_size: usize) -> BytesMut;

    /// Returns a buffer to the pool. Buffers that have too little capacity
    /// left are dropped.
    fn recycle(&self, buffer: BytesMut);

    /// Splits the first `len` bytes off `buffer` as a frozen segment and
    /// recycles the rest.
    fn extract_and_recycle(&self, mut buffer: BytesMut, len: usize) -> Bytes {
        let data = buffer.split_to(len).freeze();
        self.recycle(buffer);
        data
    }

    /// Total writable bytes currently pooled.
    fn pooled_size(&self) -> usize;

    /// Size of freshly allocated buffers.
    fn preallocation_size(&self) -> usize;
}

fn allocate(preallocation_size: usize, min_size: usize) -> BytesMut {
    BytesMut::zeroed(preallocation_size.max(min_size))
}

// ============================================================================
// Single-threaded Memory Manager
// ============================================================================

/// Memory manager owned by one dispatcher thread.
///
/// Keeps a single free slot and takes no locks. It is `Send` but not `Sync`,
/// so it can move to its reactor thread but never be shared.
#[derive(Debug)]
pub struct UnsyncMemoryManager {
    slot: RefCell<Option<BytesMut>>,
    preallocation_size: usize,
    min_buffer_size: usize,
}

impl UnsyncMemoryManager {
    pub fn new(preallocation_size: usize, min_buffer_size: usize) -> Self {
        Self {
            slot: RefCell::new(None),
            preallocation_size: preallocation_size.max(1),
            min_buffer_size: min_buffer_size.max(1),
        }
    }
}

impl Default for UnsyncMemoryManager {
    fn default() -> Self {
        Self::new(
            DEFAULT_READ_BUFFER_PREALLOCATION_SIZE,
            DEFAULT_READ_BUFFER_MIN_SIZE,
        )
    }
}

impl MemoryManager for UnsyncMemoryManager {
    fn acquire(&self, min_size: usize) -> BytesMut {
        match self.slot.borrow_mut().take() {
            Some(buffer) if buffer.len() >= min_size => buffer,
            Some(small) => {
                trace!(
                    len = small.len(),
                    min_size,
                    "Pooled buffer too small, allocating a new one"
                );
                allocate(self.preallocation_size, min_size)
            }
            None => allocate(self.preallocation_size, min_size),
        }
    }

    fn recycle(&self, buffer: BytesMut) {
        if buffer.len() >= self.min_buffer_size {
            *self.slot.borrow_mut() = Some(buffer);
        }
    }

    fn pooled_size(&self) -> usize {
        self.slot.borrow().as_ref().map_or(0, BytesMut::len)
    }

    fn preallocation_size(&self) -> usize {
        self.preallocation_size
    }
}

// ============================================================================
// Shared Memory Manager
// ============================================================================

/// Memory manager shared across threads, used for TLS record buffers.
///
/// Backed by a bounded free list behind a mutex.
#[derive(Debug)]
pub struct SharedMemoryManager {
    free: Mutex<Vec<BytesMut>>,
    preallocation_size: usize,
    min_buffer_size: usize,
    limit: usize,
}

impl SharedMemoryManager {
    pub fn new(preallocation_size: usize, min_buffer_size: usize) -> Self {
        Self::with_limit(preallocation_size, min_buffer_size, DEFAULT_SHARED_POOL_LIMIT)
    }

    /// Creates a manager that pools at most `limit` buffers.
    pub fn with_limit(preallocation_size: usize, min_buffer_size: usize, limit: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            preallocation_size: preallocation_size.max(1),
            min_buffer_size: min_buffer_size.max(1),
            limit,
        }
    }
}

impl Default for SharedMemoryManager {
    fn default() -> Self {
        Self::new(
            DEFAULT_READ_BUFFER_PREALLOCATION_SIZE,
            DEFAULT_READ_BUFFER_MIN_SIZE,
        )
    }
}

impl MemoryManager for SharedMemoryManager {
    fn acquire(&self, min_size: usize) -> BytesMut {
        let pooled = {
            let mut free = crate::lock(&self.free);
            free.pop()
        };
        match pooled {
            Some(buffer) if buffer.len() >= min_size => buffer,
            _ => allocate(self.preallocation_size, min_size),
        }
    }

    fn recycle(&self, buffer: BytesMut) {
        if buffer.len() < self.min_buffer_size {
            return;
        }
        let mut free = crate::lock(&self.free);
        if free.len() < self.limit {
            free.push(buffer);
        }
    }

    fn pooled_size(&self) -> usize {
        crate::lock(&self.free).iter().map(BytesMut::len).sum()
    }

    fn preallocation_size(&self) -> usize {
        self.preallocation_size
    }
}
