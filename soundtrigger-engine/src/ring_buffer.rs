/// Ring buffer module for captured keyword audio
///
/// Fixed-capacity circular byte store with a single writer (the buffering
/// thread) and any number of independent reader cursors. The writer is
/// throttled by the slowest attached reader: buffered history is kept until
/// every reader has consumed it.

use cache_padded::CachePadded;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Default ring buffer size when the stream attributes cannot size it
pub const DEFAULT_RING_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum RingBufferError {
    #[error("Invalid buffer size: {0}")]
    InvalidSize(usize),
}

struct RingState {
    data: Box<[u8]>,
    /// Absolute number of bytes ever written
    write_pos: u64,
    /// Absolute read offset per attached reader, `None` once detached
    readers: Vec<Option<u64>>,
}

impl RingState {
    fn free_size(&self) -> usize {
        let capacity = self.data.len();
        match self.readers.iter().flatten().min() {
            Some(&slowest) => capacity - (self.write_pos - slowest) as usize,
            None => capacity,
        }
    }
}

/// Circular byte buffer shared between the buffering thread and readers
pub struct RingBuffer {
    state: CachePadded<Mutex<RingState>>,
    capacity: usize,
}

impl RingBuffer {
    /// Create a ring buffer holding `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Result<Self, RingBufferError> {
        if capacity == 0 {
            return Err(RingBufferError::InvalidSize(capacity));
        }

        debug!("Creating ring buffer with capacity: {} bytes", capacity);

        Ok(Self {
            state: CachePadded::new(Mutex::new(RingState {
                data: vec![0u8; capacity].into_boxed_slice(),
                write_pos: 0,
                readers: Vec::new(),
            })),
            capacity,
        })
    }

    /// Write bytes into the buffer
    ///
    /// Accepts `min(data.len(), free_size())` bytes and returns that count.
    /// The caller owns any remainder.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut state = self.state.lock();

        let to_write = data.len().min(state.free_size());
        if to_write == 0 {
            return 0;
        }

        let start = (state.write_pos % self.capacity as u64) as usize;
        let first = to_write.min(self.capacity - start);
        state.data[start..start + first].copy_from_slice(&data[..first]);
        state.data[..to_write - first].copy_from_slice(&data[first..to_write]);
        state.write_pos += to_write as u64;

        trace!("Wrote {} of {} bytes to ring buffer", to_write, data.len());
        to_write
    }

    /// Space available to the writer, bounded by the slowest reader
    pub fn free_size(&self) -> usize {
        self.state.lock().free_size()
    }

    /// Create a reader positioned at the current write cursor
    pub fn new_reader(self: &Arc<Self>) -> RingBufferReader {
        let mut state = self.state.lock();
        let position = state.write_pos;

        let slot = match state.readers.iter().position(Option::is_none) {
            Some(slot) => {
                state.readers[slot] = Some(position);
                slot
            }
            None => {
                state.readers.push(Some(position));
                state.readers.len() - 1
            }
        };

        debug!("Attached ring buffer reader {} at offset {}", slot, position);

        RingBufferReader {
            ring: Arc::clone(self),
            slot,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes accepted since creation
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().write_pos
    }

    /// Number of readers currently attached
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.iter().flatten().count()
    }
}

/// Independent read cursor into a [`RingBuffer`]
///
/// Dropping the reader detaches it, so it no longer holds back the writer.
pub struct RingBufferReader {
    ring: Arc<RingBuffer>,
    slot: usize,
}

impl RingBufferReader {
    /// Copy unread bytes into `buf`, returning how many were copied
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let capacity = self.ring.capacity;
        let mut state = self.ring.state.lock();

        let Some(position) = state.readers[self.slot] else {
            return 0;
        };

        let available = (state.write_pos - position) as usize;
        let to_read = buf.len().min(available);
        if to_read == 0 {
            return 0;
        }

        let start = (position % capacity as u64) as usize;
        let first = to_read.min(capacity - start);
        buf[..first].copy_from_slice(&state.data[start..start + first]);
        buf[first..to_read].copy_from_slice(&state.data[..to_read - first]);
        state.readers[self.slot] = Some(position + to_read as u64);

        to_read
    }

    /// Read everything currently available
    pub fn read_available(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.available()];
        let read = self.read(&mut out);
        out.truncate(read);
        out
    }

    /// Advance the cursor without copying, returning bytes skipped
    pub fn skip(&mut self, count: usize) -> usize {
        let mut state = self.ring.state.lock();
        let write_pos = state.write_pos;

        match state.readers[self.slot].as_mut() {
            Some(position) => {
                let skipped = count.min((write_pos - *position) as usize);
                *position += skipped as u64;
                skipped
            }
            None => 0,
        }
    }

    /// Bytes written but not yet consumed by this reader
    pub fn available(&self) -> usize {
        let state = self.ring.state.lock();
        state.readers[self.slot]
            .map(|position| (state.write_pos - position) as usize)
            .unwrap_or(0)
    }

    /// Absolute offset of this cursor
    pub fn position(&self) -> u64 {
        self.ring.state.lock().readers[self.slot].unwrap_or(0)
    }

    /// Buffer this reader belongs to
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }
}

impl Drop for RingBufferReader {
    fn drop(&mut self) {
        let mut state = self.ring.state.lock();
        state.readers[self.slot] = None;
        trace!("Detached ring buffer reader {}", self.slot);
    }
}
