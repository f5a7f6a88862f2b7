// =============================================================================
// Channel Memory Backends
// =============================================================================
//
// The ring channel is written against `MemoryBackend`, a word-addressed
// region with load/store/wait/notify. Two implementations:
//
//   SharedMemory — `Arc<[AtomicU32]>` payload and metadata, visible to any
//                  thread. Metadata is stored with Release and loaded with
//                  Acquire so a reader that observes a new `count` also
//                  observes the payload words written before it. Waiters
//                  park on a per-series Condvar.
//
//   LocalMemory  — plain `Cell<u32>` storage for single-context use. The
//                  type is !Sync, so the compiler keeps it on one thread and
//                  the atomicity requirement holds trivially. Waiting never
//                  blocks because no other context can make progress.
// =============================================================================

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::{PipelineError, Result};

/// Words of metadata kept per series: `[write_offset, count]`.
pub const META_WORDS_PER_SERIES: usize = 2;
pub const META_WRITE_OFFSET: usize = 0;
pub const META_COUNT: usize = 1;

/// A word-addressed memory region backing a ring channel.
pub trait MemoryBackend: Sized {
    /// Raw handles handed to the rendering side by `RingChannel::buffers`.
    type Buffers;

    /// Whether the region is visible to other threads without copying.
    const SHARED: bool;

    fn allocate(data_words: usize, series_count: usize) -> Result<Self>;

    fn load_data(&self, index: usize) -> u32;

    fn store_data(&self, index: usize, value: u32);

    fn load_meta(&self, index: usize) -> u32;

    fn store_meta(&self, index: usize, value: u32);

    /// Block until `ready()` returns true or `deadline` passes. Returns the
    /// final value of `ready()`.
    fn wait_until<F: FnMut() -> bool>(&self, series: usize, deadline: Instant, ready: F) -> bool;

    fn notify(&self, series: usize);

    fn buffers(&self) -> Self::Buffers;
}

fn try_alloc_vec<T>(len: usize, what: &str, init: impl FnMut() -> T) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|e| PipelineError::Allocation {
        requested: len.saturating_mul(std::mem::size_of::<T>()),
        reason: format!("{what}: {e}"),
    })?;
    v.resize_with(len, init);
    Ok(v)
}

// ---------------------------------------------------------------------------
// SharedMemory
// ---------------------------------------------------------------------------

/// Handles to the shared payload and metadata words. Cloning is cheap and
/// does not copy the underlying memory.
#[derive(Debug, Clone)]
pub struct SharedBuffers {
    pub data: Arc<[AtomicU32]>,
    pub metadata: Arc<[AtomicU32]>,
}

impl SharedBuffers {
    /// Published point count of `series`, as the render side would read it.
    pub fn data_count(&self, series: usize) -> u32 {
        self.metadata
            .get(series * META_WORDS_PER_SERIES + META_COUNT)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }
}

pub struct SharedMemory {
    data: Arc<[AtomicU32]>,
    metadata: Arc<[AtomicU32]>,
    waiters: Box<[(Mutex<()>, Condvar)]>,
}

impl MemoryBackend for SharedMemory {
    type Buffers = SharedBuffers;
    const SHARED: bool = true;

    fn allocate(data_words: usize, series_count: usize) -> Result<Self> {
        let data = try_alloc_vec(data_words, "payload", || AtomicU32::new(0))?;
        let metadata = try_alloc_vec(
            series_count * META_WORDS_PER_SERIES,
            "metadata",
            || AtomicU32::new(0),
        )?;
        let waiters = (0..series_count)
            .map(|_| (Mutex::new(()), Condvar::new()))
            .collect();
        Ok(Self {
            data: Arc::from(data),
            metadata: Arc::from(metadata),
            waiters,
        })
    }

    fn load_data(&self, index: usize) -> u32 {
        self.data[index].load(Ordering::Relaxed)
    }

    fn store_data(&self, index: usize, value: u32) {
        self.data[index].store(value, Ordering::Relaxed);
    }

    fn load_meta(&self, index: usize) -> u32 {
        self.metadata[index].load(Ordering::Acquire)
    }

    fn store_meta(&self, index: usize, value: u32) {
        self.metadata[index].store(value, Ordering::Release);
    }

    fn wait_until<F: FnMut() -> bool>(&self, series: usize, deadline: Instant, mut ready: F) -> bool {
        let (lock, cv) = &self.waiters[series];
        let mut guard = lock.lock();
        loop {
            if ready() {
                return true;
            }
            if cv.wait_until(&mut guard, deadline).timed_out() {
                return ready();
            }
        }
    }

    fn notify(&self, series: usize) {
        // Taking the lock closes the gap between a waiter's check and park.
        let (lock, cv) = &self.waiters[series];
        let _guard = lock.lock();
        cv.notify_all();
    }

    fn buffers(&self) -> SharedBuffers {
        SharedBuffers {
            data: Arc::clone(&self.data),
            metadata: Arc::clone(&self.metadata),
        }
    }
}

// ---------------------------------------------------------------------------
// LocalMemory
// ---------------------------------------------------------------------------

/// Deep copies of the local payload and metadata words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBuffers {
    pub data: Vec<u32>,
    pub metadata: Vec<u32>,
}

impl LocalBuffers {
    pub fn data_count(&self, series: usize) -> u32 {
        self.metadata
            .get(series * META_WORDS_PER_SERIES + META_COUNT)
            .copied()
            .unwrap_or(0)
    }
}

pub struct LocalMemory {
    data: Box<[Cell<u32>]>,
    metadata: Box<[Cell<u32>]>,
}

impl MemoryBackend for LocalMemory {
    type Buffers = LocalBuffers;
    const SHARED: bool = false;

    fn allocate(data_words: usize, series_count: usize) -> Result<Self> {
        let data = try_alloc_vec(data_words, "payload", || Cell::new(0))?;
        let metadata = try_alloc_vec(series_count * META_WORDS_PER_SERIES, "metadata", || Cell::new(0))?;
        Ok(Self {
            data: data.into_boxed_slice(),
            metadata: metadata.into_boxed_slice(),
        })
    }

    fn load_data(&self, index: usize) -> u32 {
        self.data[index].get()
    }

    fn store_data(&self, index: usize, value: u32) {
        self.data[index].set(value);
    }

    fn load_meta(&self, index: usize) -> u32 {
        self.metadata[index].get()
    }

    fn store_meta(&self, index: usize, value: u32) {
        self.metadata[index].set(value);
    }

    fn wait_until<F: FnMut() -> bool>(&self, _series: usize, _deadline: Instant, mut ready: F) -> bool {
        ready()
    }

    fn notify(&self, _series: usize) {}

    fn buffers(&self) -> LocalBuffers {
        LocalBuffers {
            data: self.data.iter().map(Cell::get).collect(),
            metadata: self.metadata.iter().map(Cell::get).collect(),
        }
    }
}
