//! Byte ring buffer between the audio producer and the sender thread.
//!
//! One mutex covers the whole ring: the available count and the copy-out
//! happen under the same acquisition, so a read can never run past data a
//! concurrent write has not finished. Writes never block and never fail;
//! when space runs out the oldest bytes are dropped.

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

/// Fixed-capacity, internally synchronized byte FIFO with drop-oldest overflow
pub struct RingBuffer {
    inner: Mutex<HeapRb<u8>>,
    capacity: usize,
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` bytes.
    ///
    /// A zero capacity is rounded up to one byte.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(HeapRb::new(capacity)),
            capacity,
        }
    }

    /// Append `data`, discarding the oldest queued bytes if it does not fit.
    ///
    /// Returns the number of previously queued bytes that were discarded
    /// (0 when everything fit). If `data` alone exceeds the capacity only its
    /// newest `capacity` bytes are kept.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let mut rb = self.inner.lock();

        if data.len() >= self.capacity {
            let dropped = rb.occupied_len();
            rb.clear();
            rb.push_slice(&data[data.len() - self.capacity..]);
            return dropped;
        }

        let vacant = rb.vacant_len();
        let dropped = data.len().saturating_sub(vacant);
        if dropped > 0 {
            rb.skip(dropped);
        }
        rb.push_slice(data);
        dropped
    }

    /// Copy up to `dest.len()` bytes out, oldest first. Never blocks.
    ///
    /// Returns the number of bytes copied; the rest of `dest` is untouched.
    pub fn read_up_to(&self, dest: &mut [u8]) -> usize {
        if dest.is_empty() {
            return 0;
        }
        self.inner.lock().pop_slice(dest)
    }

    /// Bytes currently queued
    pub fn filled(&self) -> usize {
        self.inner.lock().occupied_len()
    }

    /// Bytes that can be written without dropping anything
    pub fn space(&self) -> usize {
        self.inner.lock().vacant_len()
    }

    /// Discard everything queued
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Maximum number of bytes the ring holds
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("filled", &self.filled())
            .finish()
    }
}
