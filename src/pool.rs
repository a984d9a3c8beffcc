//! Fixed-capacity pool of reusable frame buffers
//!
//! Every captured frame lives in one of a fixed number of pool slots. Frames
//! are handed out as reference-counted handles (`Frame`), so fanning a frame
//! out to N clients never copies the JPEG data. A slot goes back to the pool
//! when the last handle is released, which bounds the memory held by frames
//! in flight to `capacity * slot_size` no matter how slow the clients are.

use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::trace;

/// Slot count when the board has external RAM
pub const PSRAM_SLOT_COUNT: usize = 4;

/// Slot size when the board has external RAM
pub const PSRAM_SLOT_SIZE: usize = 256 * 1024;

/// Slot count on internal RAM only
pub const DRAM_SLOT_COUNT: usize = 2;

/// Slot size on internal RAM only
pub const DRAM_SLOT_SIZE: usize = 64 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("frame pool exhausted: all {0} slots in use")]
    PoolExhausted(usize),

    #[error("frame of {len} bytes does not fit in a {capacity} byte slot")]
    SlotOverflow { len: usize, capacity: usize },
}

struct Slot {
    in_use: AtomicBool,
    buffer: Mutex<Option<Vec<u8>>>,
}

struct PoolInner {
    slots: Box<[Slot]>,
    slot_size: usize,
    exhaustions: AtomicU64,
}

impl PoolInner {
    fn reclaim(&self, index: usize, mut buf: Vec<u8>) {
        buf.clear();
        let slot = &self.slots[index];
        *slot.buffer.lock() = Some(buf);
        slot.in_use.store(false, Ordering::Release);
        trace!(slot = index, "Frame slot reclaimed");
    }
}

/// Pool of frame slots shared by the capture path and all consumers
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Creates a pool with `capacity` slots of `slot_size` bytes each.
    ///
    /// All memory is allocated up front; the pool never grows.
    pub fn new(capacity: usize, slot_size: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                in_use: AtomicBool::new(false),
                buffer: Mutex::new(Some(Vec::with_capacity(slot_size))),
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                slots,
                slot_size,
                exhaustions: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a pool sized for the available memory
    pub fn for_memory(psram: bool) -> Self {
        if psram {
            Self::new(PSRAM_SLOT_COUNT, PSRAM_SLOT_SIZE)
        } else {
            Self::new(DRAM_SLOT_COUNT, DRAM_SLOT_SIZE)
        }
    }

    /// Claims a free slot for writing a new frame.
    ///
    /// Fails with [`PoolError::PoolExhausted`] when every slot is still
    /// referenced by some consumer; the caller is expected to skip this
    /// capture cycle rather than wait.
    pub fn acquire(&self) -> Result<SlotWriter, PoolError> {
        for (index, slot) in self.inner.slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let buf = slot
                    .buffer
                    .lock()
                    .take()
                    .unwrap_or_else(|| Vec::with_capacity(self.inner.slot_size));

                return Ok(SlotWriter {
                    pool: Arc::clone(&self.inner),
                    index,
                    buf: Some(buf),
                });
            }
        }

        self.inner.exhaustions.fetch_add(1, Ordering::Relaxed);
        Err(PoolError::PoolExhausted(self.capacity()))
    }

    /// Takes another reference to `frame` for an asynchronous consumer
    pub fn retain(&self, frame: &Frame) -> Frame {
        frame.clone()
    }

    /// Gives up one reference to `frame`; the slot is reclaimed at zero
    pub fn release(&self, frame: Frame) {
        drop(frame);
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn slot_size(&self) -> usize {
        self.inner.slot_size
    }

    /// Number of slots currently available to `acquire`
    pub fn free_slots(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| !slot.in_use.load(Ordering::Acquire))
            .count()
    }

    /// Number of `acquire` calls that failed because the pool was full
    pub fn exhaustions(&self) -> u64 {
        self.inner.exhaustions.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("capacity", &self.capacity())
            .field("slot_size", &self.slot_size())
            .field("free", &self.free_slots())
            .finish()
    }
}

/// Exclusive write access to a claimed slot.
///
/// Dropping the writer without calling [`SlotWriter::commit`] hands the slot
/// straight back to the pool.
pub struct SlotWriter {
    pool: Arc<PoolInner>,
    index: usize,
    buf: Option<Vec<u8>>,
}

impl SlotWriter {
    /// Appends bytes to the frame being written
    pub fn extend(&mut self, data: &[u8]) -> Result<(), PoolError> {
        let capacity = self.pool.slot_size;
        let buf = self.buf.get_or_insert_with(Vec::new);

        let len = buf.len() + data.len();
        if len > capacity {
            return Err(PoolError::SlotOverflow { len, capacity });
        }

        buf.extend_from_slice(data);
        Ok(())
    }

    /// Discards anything written so far
    pub fn clear(&mut self) {
        if let Some(buf) = self.buf.as_mut() {
            buf.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can still be written before the slot overflows
    pub fn remaining(&self) -> usize {
        self.pool.slot_size - self.len()
    }

    pub fn slot(&self) -> usize {
        self.index
    }

    /// Seals the slot contents into an immutable, shareable frame
    pub fn commit(mut self, sequence: u64, captured_at: Instant) -> Frame {
        let payload = self.buf.take().unwrap_or_default();

        Frame {
            shared: Arc::new(FrameShared {
                sequence,
                captured_at,
                payload,
                slot: self.index,
                pool: Arc::clone(&self.pool),
            }),
        }
    }
}

impl io::Write for SlotWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.extend(data)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SlotWriter {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.reclaim(self.index, buf);
        }
    }
}

struct FrameShared {
    sequence: u64,
    captured_at: Instant,
    payload: Vec<u8>,
    slot: usize,
    pool: Arc<PoolInner>,
}

impl Drop for FrameShared {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.payload);
        self.pool.reclaim(self.slot, buf);
    }
}

/// A captured, encoded frame.
///
/// Cloning a `Frame` takes a new reference to the same pool slot; the
/// payload is never copied and never mutated after capture.
#[derive(Clone)]
pub struct Frame {
    shared: Arc<FrameShared>,
}

impl Frame {
    /// Monotonic capture sequence number
    pub fn sequence(&self) -> u64 {
        self.shared.sequence
    }

    /// Monotonic capture time
    pub fn captured_at(&self) -> Instant {
        self.shared.captured_at
    }

    /// Encoded JPEG bytes
    pub fn payload(&self) -> &[u8] {
        &self.shared.payload
    }

    pub fn len(&self) -> usize {
        self.shared.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.payload.is_empty()
    }

    /// Pool slot backing this frame
    pub fn slot(&self) -> usize {
        self.shared.slot
    }

    /// Number of live references to this frame's slot
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence())
            .field("len", &self.len())
            .field("slot", &self.slot())
            .field("refs", &self.ref_count())
            .finish()
    }
}
