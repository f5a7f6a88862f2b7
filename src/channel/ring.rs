// =============================================================================
// Ring Channel — fixed-capacity circular point store per series
// =============================================================================
//
// One region holds `series_count * max_data_points` points laid out series by
// series. Each series owns a metadata record `[write_offset, count]`.
//
// Publication order for every mutation: payload words first, then
// `write_offset`, then `count` (both Release). A reader loads `count` first
// (Acquire), so it can lag one batch behind the payload but never run ahead.
//
// Writers to the same series are serialised by a per-series mutex; readers
// never lock.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::memory::{
    MemoryBackend, SharedMemory, META_COUNT, META_WORDS_PER_SERIES, META_WRITE_OFFSET,
};
use crate::error::{PipelineError, Result};
use crate::types::{PointLayout, WirePoint};

/// Construction parameters for a ring channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub series_count: usize,
    pub max_data_points: usize,
    pub layout: PointLayout,
}

/// Result of `wait_for_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The series holds at least the requested number of points.
    Ready(u32),
    /// The series was cleared while waiting.
    Cleared,
}

/// What `upsert` did with the incoming point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Appended,
    Replaced,
    Inserted,
    /// Older than everything in a full ring; it would be evicted immediately.
    Dropped,
}

pub struct RingChannel<B: MemoryBackend = SharedMemory> {
    memory: B,
    layout: PointLayout,
    capacity: usize,
    series_count: usize,
    writers: Box<[Mutex<()>]>,
    generations: Box<[AtomicU32]>,
}

/// `count` and oldest physical slot of a series, loaded once per operation.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    count: usize,
    oldest: usize,
}

pub type SharedRingChannel = RingChannel<SharedMemory>;
pub type LocalRingChannel = RingChannel<super::memory::LocalMemory>;

impl<B: MemoryBackend> RingChannel<B> {
    /// Allocate the payload and metadata regions.
    ///
    /// Fails with `Allocation` when `max_data_points * series_count * stride`
    /// overflows or cannot be reserved.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        if config.series_count == 0 || config.max_data_points == 0 {
            return Err(PipelineError::InvalidInput(
                "ring channel needs at least one series and one point of capacity".into(),
            ));
        }
        if config.max_data_points > u32::MAX as usize {
            return Err(PipelineError::Allocation {
                requested: usize::MAX,
                reason: format!("max_data_points {} exceeds u32 metadata", config.max_data_points),
            });
        }

        let words = config
            .max_data_points
            .checked_mul(config.series_count)
            .and_then(|n| n.checked_mul(config.layout.words()))
            .ok_or_else(|| PipelineError::Allocation {
                requested: usize::MAX,
                reason: format!(
                    "{} points x {} series x {} bytes overflows",
                    config.max_data_points,
                    config.series_count,
                    config.layout.stride()
                ),
            })?;

        let memory = B::allocate(words, config.series_count)?;

        debug!(
            series = config.series_count,
            capacity = config.max_data_points,
            layout = %config.layout,
            shared = B::SHARED,
            bytes = words * 4,
            "ring channel allocated"
        );

        Ok(Self {
            memory,
            layout: config.layout,
            capacity: config.max_data_points,
            series_count: config.series_count,
            writers: (0..config.series_count).map(|_| Mutex::new(())).collect(),
            generations: (0..config.series_count).map(|_| AtomicU32::new(0)).collect(),
        })
    }

    pub fn layout(&self) -> PointLayout {
        self.layout
    }

    /// Maximum number of points retained per series.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn series_count(&self) -> usize {
        self.series_count
    }

    pub fn is_shared(&self) -> bool {
        B::SHARED
    }

    /// Raw payload/metadata handles for the rendering side.
    pub fn buffers(&self) -> B::Buffers {
        self.memory.buffers()
    }

    /// Published point count of `series`.
    pub fn data_count(&self, series: usize) -> Result<u32> {
        self.check_series(series)?;
        Ok(self.memory.load_meta(meta_index(series, META_COUNT)))
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Append raw little-endian point bytes, overwriting the oldest points
    /// once the series is full.
    pub fn write(&self, series: usize, bytes: &[u8]) -> Result<usize> {
        self.check_series(series)?;
        let stride = self.layout.stride();
        if bytes.len() % stride != 0 {
            return Err(PipelineError::InvalidInput(format!(
                "write of {} bytes is not a multiple of stride {stride}",
                bytes.len()
            )));
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let _guard = self.writers[series].lock();
        Ok(self.append_locked(series, &words))
    }

    /// Append typed points.
    pub fn write_points<P: WirePoint>(&self, series: usize, points: &[P]) -> Result<usize> {
        self.check_series(series)?;
        self.check_layout::<P>()?;
        let w = self.layout.words();
        let mut words = vec![0u32; points.len() * w];
        let mut scratch = [0.0f32; 6];
        for (p, out) in points.iter().zip(words.chunks_exact_mut(w)) {
            p.write_words(&mut scratch[..w]);
            for (dst, src) in out.iter_mut().zip(&scratch[..w]) {
                *dst = src.to_bits();
            }
        }
        let _guard = self.writers[series].lock();
        Ok(self.append_locked(series, &words))
    }

    /// Insert-or-replace keyed on the point's timestamp.
    ///
    /// A point whose time matches a retained point overwrites it in place;
    /// a newer point is appended; an older one is inserted in time order,
    /// evicting the oldest point when the series is full.
    pub fn upsert<P: WirePoint>(&self, series: usize, point: P) -> Result<UpsertOutcome> {
        self.check_series(series)?;
        self.check_layout::<P>()?;
        let w = self.layout.words();
        let mut scratch = [0.0f32; 6];
        point.write_words(&mut scratch[..w]);
        let words: Vec<u32> = scratch[..w].iter().map(|f| f.to_bits()).collect();
        let time = point.time();

        let _guard = self.writers[series].lock();
        let cursor = self.cursor(series);
        let count = cursor.count;
        if count == 0 || time > self.time_at(series, cursor, count - 1) {
            self.append_locked(series, &words);
            return Ok(UpsertOutcome::Appended);
        }

        // First logical index whose time is >= `time`.
        let (mut lo, mut hi) = (0usize, count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.time_at(series, cursor, mid) < time {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let idx = lo;

        if self.time_at(series, cursor, idx) == time {
            self.store_slot(series, cursor, idx, &words);
            self.memory.notify(series);
            trace!(series, time, "ring point replaced");
            return Ok(UpsertOutcome::Replaced);
        }

        if count < self.capacity {
            for i in (idx..count).rev() {
                self.copy_slot(series, cursor, i, i + 1);
            }
            self.store_slot(series, cursor, idx, &words);
            self.publish(series, (count + 1) % self.capacity, count + 1);
        } else {
            if idx == 0 {
                return Ok(UpsertOutcome::Dropped);
            }
            for i in 1..idx {
                self.copy_slot(series, cursor, i, i - 1);
            }
            self.store_slot(series, cursor, idx - 1, &words);
            self.memory.notify(series);
        }
        Ok(UpsertOutcome::Inserted)
    }

    /// Reset cursor and count to zero and wake any waiter.
    pub fn clear(&self, series: usize) -> Result<()> {
        self.check_series(series)?;
        let _guard = self.writers[series].lock();
        self.generations[series].fetch_add(1, Ordering::AcqRel);
        self.publish(series, 0, 0);
        debug!(series, "ring series cleared");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Up to `count` points starting at logical index `start` (0 = oldest
    /// retained point) as little-endian bytes. Empty when `start` is past the
    /// end.
    pub fn read(&self, series: usize, start: usize, count: usize) -> Result<Bytes> {
        let words = self.read_words(series, start, count)?;
        let mut buf = BytesMut::with_capacity(words.len() * 4);
        for w in words {
            buf.put_u32_le(w);
        }
        Ok(buf.freeze())
    }

    /// Typed variant of [`read`](Self::read).
    pub fn read_points<P: WirePoint>(&self, series: usize, start: usize, count: usize) -> Result<Vec<P>> {
        self.check_layout::<P>()?;
        let words = self.read_words(series, start, count)?;
        let w = self.layout.words();
        let mut scratch = [0.0f32; 6];
        Ok(words
            .chunks_exact(w)
            .map(|chunk| {
                for (dst, src) in scratch[..w].iter_mut().zip(chunk) {
                    *dst = f32::from_bits(*src);
                }
                P::from_words(&scratch[..w])
            })
            .collect())
    }

    /// The newest `n` points, oldest first.
    pub fn latest<P: WirePoint>(&self, series: usize, n: usize) -> Result<Vec<P>> {
        let total = self.data_count(series)? as usize;
        self.read_points(series, total.saturating_sub(n), n)
    }

    /// Raw bytes of the newest `n` points.
    pub fn latest_bytes(&self, series: usize, n: usize) -> Result<Bytes> {
        let total = self.data_count(series)? as usize;
        self.read(series, total.saturating_sub(n), n)
    }

    /// Logical index of the retained point with exactly this timestamp.
    pub fn find_time(&self, series: usize, time: f32) -> Result<Option<usize>> {
        self.check_series(series)?;
        let cursor = self.cursor(series);
        let (mut lo, mut hi) = (0usize, cursor.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.time_at(series, cursor, mid) < time {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok((lo < cursor.count && self.time_at(series, cursor, lo) == time).then_some(lo))
    }

    /// Block until the series holds at least `min_count` points, the series
    /// is cleared, or `timeout` elapses (`Timeout`).
    pub fn wait_for_data(&self, series: usize, min_count: u32, timeout: Duration) -> Result<WaitOutcome> {
        self.check_series(series)?;
        let generation = self.generations[series].load(Ordering::Acquire);
        let deadline = Instant::now() + timeout;
        let mut cleared = false;
        let ready = self.memory.wait_until(series, deadline, || {
            if self.generations[series].load(Ordering::Acquire) != generation {
                cleared = true;
                return true;
            }
            self.memory.load_meta(meta_index(series, META_COUNT)) >= min_count
        });
        if cleared {
            return Ok(WaitOutcome::Cleared);
        }
        if ready {
            return Ok(WaitOutcome::Ready(
                self.memory.load_meta(meta_index(series, META_COUNT)),
            ));
        }
        Err(PipelineError::Timeout(timeout))
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn check_series(&self, series: usize) -> Result<()> {
        if series >= self.series_count {
            return Err(PipelineError::IndexOutOfRange {
                index: series,
                series_count: self.series_count,
            });
        }
        Ok(())
    }

    fn check_layout<P: WirePoint>(&self) -> Result<()> {
        if P::LAYOUT != self.layout {
            return Err(PipelineError::InvalidInput(format!(
                "{} points on a {} channel",
                P::LAYOUT,
                self.layout
            )));
        }
        Ok(())
    }

    /// Caller holds the series writer lock.
    fn append_locked(&self, series: usize, words: &[u32]) -> usize {
        let w = self.layout.words();
        let n_points = words.len() / w;
        if n_points == 0 {
            return 0;
        }
        let mut offset = self.memory.load_meta(meta_index(series, META_WRITE_OFFSET)) as usize;
        let count = self.memory.load_meta(meta_index(series, META_COUNT)) as usize;

        // Only the newest `capacity` points of an oversized batch survive.
        let skip = n_points.saturating_sub(self.capacity);
        for point in words.chunks_exact(w).skip(skip) {
            let base = self.slot_base(series, offset);
            for (k, word) in point.iter().enumerate() {
                self.memory.store_data(base + k, *word);
            }
            offset = (offset + 1) % self.capacity;
        }

        let new_count = (count + n_points).min(self.capacity);
        self.publish(series, offset, new_count);
        n_points
    }

    fn publish(&self, series: usize, write_offset: usize, count: usize) {
        self.memory
            .store_meta(meta_index(series, META_WRITE_OFFSET), write_offset as u32);
        self.memory.store_meta(meta_index(series, META_COUNT), count as u32);
        self.memory.notify(series);
    }

    fn read_words(&self, series: usize, start: usize, count: usize) -> Result<Vec<u32>> {
        self.check_series(series)?;
        // Every slot of one read resolves against the same cursor, so a
        // concurrent wrap can tear the overwritten head but never splice
        // the window.
        let cursor = self.cursor(series);
        if start >= cursor.count || count == 0 {
            return Ok(Vec::new());
        }
        let n = count.min(cursor.count - start);
        let w = self.layout.words();
        let mut out = Vec::with_capacity(n * w);
        for i in 0..n {
            let base = self.logical_base(series, cursor, start + i);
            for k in 0..w {
                out.push(self.memory.load_data(base + k));
            }
        }
        Ok(out)
    }

    /// `count` is loaded first (Acquire), so the offset read after it is at
    /// least as new as the one published with it.
    fn cursor(&self, series: usize) -> Cursor {
        let count = self.memory.load_meta(meta_index(series, META_COUNT)) as usize;
        let oldest = if count < self.capacity {
            0
        } else {
            self.memory.load_meta(meta_index(series, META_WRITE_OFFSET)) as usize
        };
        Cursor { count, oldest }
    }

    fn slot_base(&self, series: usize, slot: usize) -> usize {
        (series * self.capacity + slot) * self.layout.words()
    }

    fn logical_base(&self, series: usize, cursor: Cursor, logical: usize) -> usize {
        self.slot_base(series, (cursor.oldest + logical) % self.capacity)
    }

    fn time_at(&self, series: usize, cursor: Cursor, logical: usize) -> f32 {
        f32::from_bits(self.memory.load_data(self.logical_base(series, cursor, logical)))
    }

    fn store_slot(&self, series: usize, cursor: Cursor, logical: usize, words: &[u32]) {
        let base = self.logical_base(series, cursor, logical);
        for (k, word) in words.iter().enumerate() {
            self.memory.store_data(base + k, *word);
        }
    }

    fn copy_slot(&self, series: usize, cursor: Cursor, from: usize, to: usize) {
        let src = self.logical_base(series, cursor, from);
        let dst = self.logical_base(series, cursor, to);
        for k in 0..self.layout.words() {
            self.memory.store_data(dst + k, self.memory.load_data(src + k));
        }
    }
}

fn meta_index(series: usize, field: usize) -> usize {
    series * META_WORDS_PER_SERIES + field
}
