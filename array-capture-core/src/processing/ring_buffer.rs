//! Lock-free single-producer/single-consumer byte queue.
//!
//! Decouples the capture thread from the storage thread. One byte of
//! capacity is reserved so full and empty are distinguishable from the
//! two cursors alone. All buffer access goes through raw pointers;
//! neither side ever forms a reference into the shared storage, so the
//! two threads only synchronize through the acquire/release pairing on
//! the cursors, and there being exactly one writer and one reader is
//! enforced at the type level by the split `RingProducer` and
//! `RingConsumer` handles.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct RingInner {
    data: NonNull<u8>,
    /// Allocated bytes; usable capacity is one less.
    len: usize,
    /// Next byte the producer will write. Producer-owned; the consumer
    /// only ever acquire-loads it.
    write: AtomicUsize,
    /// Next byte the consumer will read. Mirror of the above.
    read: AtomicUsize,
}

// SAFETY: the producer touches only the region between `write` and
// `read - 1`, the consumer only between `read` and `write`, and each
// cursor is advanced by its owner only after the matching memory
// operation (release store paired with the peer's acquire load). No
// references into the storage are ever created.
unsafe impl Sync for RingInner {}
unsafe impl Send for RingInner {}

impl Drop for RingInner {
    fn drop(&mut self) {
        // SAFETY: data/len came from Box::into_raw in spsc_ring;
        // ownership returns exactly once, when the last handle drops.
        unsafe {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                self.data.as_ptr(),
                self.len,
            )));
        }
    }
}

/// Create a ring holding up to `capacity` bytes.
///
/// Returns the two endpoints; each must stay on its own thread.
pub fn spsc_ring(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity > 0, "ring capacity must be positive");
    // One reserved byte keeps full distinguishable from empty.
    let storage = vec![0u8; capacity + 1].into_boxed_slice();
    let len = storage.len();
    // SAFETY: Box::into_raw never returns null.
    let data = unsafe { NonNull::new_unchecked(Box::into_raw(storage) as *mut u8) };
    let inner = Arc::new(RingInner {
        data,
        len,
        write: AtomicUsize::new(0),
        read: AtomicUsize::new(0),
    });
    (
        RingProducer {
            inner: Arc::clone(&inner),
        },
        RingConsumer { inner },
    )
}

/// Write endpoint. Owned by the capture thread.
pub struct RingProducer {
    inner: Arc<RingInner>,
}

/// Read endpoint. Owned by the storage thread.
pub struct RingConsumer {
    inner: Arc<RingInner>,
}

impl RingProducer {
    /// Usable capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.len - 1
    }

    /// Space available right now, from the producer's point of view.
    pub fn available_space(&self) -> usize {
        let n = self.inner.len;
        let write = self.inner.write.load(Ordering::Relaxed);
        let read = self.inner.read.load(Ordering::Acquire);
        (read + n - write - 1) % n
    }

    /// Copy as much of `data` as fits; returns bytes written.
    ///
    /// Never blocks. A short write signals backpressure: the storage
    /// side is not draining fast enough and the rest is dropped by the
    /// caller's policy, not queued.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = self.inner.len;
        let write = self.inner.write.load(Ordering::Relaxed);
        let read = self.inner.read.load(Ordering::Acquire);
        let space = (read + n - write - 1) % n;
        let count = space.min(data.len());
        if count == 0 {
            return 0;
        }

        // SAFETY: [write, write+count) mod n is unreachable by the
        // consumer until the release store below publishes it, and the
        // split copy stays inside the allocation.
        let first = count.min(n - write);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.inner.data.as_ptr().add(write), first);
            if first < count {
                ptr::copy_nonoverlapping(
                    data.as_ptr().add(first),
                    self.inner.data.as_ptr(),
                    count - first,
                );
            }
        }

        self.inner.write.store((write + count) % n, Ordering::Release);
        count
    }
}

impl RingConsumer {
    /// Usable capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.len - 1
    }

    /// Bytes ready to read, from the consumer's point of view.
    pub fn available(&self) -> usize {
        let n = self.inner.len;
        let read = self.inner.read.load(Ordering::Relaxed);
        let write = self.inner.write.load(Ordering::Acquire);
        (write + n - read) % n
    }

    /// Copy up to `out.len()` bytes out; returns bytes read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.inner.len;
        let read = self.inner.read.load(Ordering::Relaxed);
        let write = self.inner.write.load(Ordering::Acquire);
        let available = (write + n - read) % n;
        let count = available.min(out.len());
        if count == 0 {
            return 0;
        }

        // SAFETY: [read, read+count) mod n was published by the
        // producer's release store observed by the acquire load above.
        let first = count.min(n - read);
        unsafe {
            ptr::copy_nonoverlapping(self.inner.data.as_ptr().add(read), out.as_mut_ptr(), first);
            if first < count {
                ptr::copy_nonoverlapping(
                    self.inner.data.as_ptr(),
                    out.as_mut_ptr().add(first),
                    count - first,
                );
            }
        }

        self.inner.read.store((read + count) % n, Ordering::Release);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let (mut tx, mut rx) = spsc_ring(64);
        assert_eq!(tx.write(b"hello"), 5);
        assert_eq!(rx.available(), 5);

        let mut out = [0u8; 16];
        assert_eq!(rx.read(&mut out), 5);
        assert_eq!(&out[..5], b"hello");
        assert_eq!(rx.available(), 0);
    }

    #[test]
    fn reports_capacity_as_requested() {
        let (tx, rx) = spsc_ring(1024);
        assert_eq!(tx.capacity(), 1024);
        assert_eq!(rx.capacity(), 1024);
        assert_eq!(tx.available_space(), 1024);
    }

    #[test]
    fn full_ring_rejects_further_writes() {
        let (mut tx, mut rx) = spsc_ring(8);
        let data = [0xABu8; 8];
        assert_eq!(tx.write(&data), 8);
        assert_eq!(tx.available_space(), 0);
        assert_eq!(tx.write(&[1]), 0);

        let mut out = [0u8; 8];
        assert_eq!(rx.read(&mut out), 8);
        assert_eq!(tx.write(&[1]), 1);
    }

    #[test]
    fn short_write_on_partial_space() {
        let (mut tx, _rx) = spsc_ring(8);
        assert_eq!(tx.write(&[1, 2, 3, 4, 5, 6]), 6);
        assert_eq!(tx.write(&[7, 8, 9, 10]), 2);
    }

    #[test]
    fn write_never_exceeds_reported_space() {
        let (mut tx, mut rx) = spsc_ring(32);
        let mut scratch = [0u8; 16];
        for round in 0..100 {
            let space = tx.available_space();
            let chunk = vec![round as u8; 13];
            let written = tx.write(&chunk);
            assert!(written <= space);
            rx.read(&mut scratch[..(round % 16) + 1]);
        }
    }

    #[test]
    fn wraparound_preserves_order() {
        let (mut tx, mut rx) = spsc_ring(8);
        let mut out = [0u8; 8];

        tx.write(&[1, 2, 3, 4, 5, 6]);
        rx.read(&mut out[..4]); // read cursor at 4
        tx.write(&[7, 8, 9, 10, 11]); // wraps

        let mut drained = Vec::new();
        loop {
            let n = rx.read(&mut out);
            if n == 0 {
                break;
            }
            drained.extend_from_slice(&out[..n]);
        }
        assert_eq!(drained, vec![5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn bytes_read_equal_bytes_written_across_threads() {
        let (mut tx, mut rx) = spsc_ring(251); // deliberately odd size
        let total: usize = 1 << 20;

        let producer = std::thread::spawn(move || {
            let mut sent = 0usize;
            let mut value = 0u8;
            while sent < total {
                let chunk: Vec<u8> = (0..97)
                    .map(|_| {
                        let v = value;
                        value = value.wrapping_add(1);
                        v
                    })
                    .take(total - sent)
                    .collect();
                let mut offset = 0;
                while offset < chunk.len() {
                    let n = tx.write(&chunk[offset..]);
                    offset += n;
                    if n == 0 {
                        std::thread::yield_now();
                    }
                }
                sent += chunk.len();
            }
        });

        let mut received = 0usize;
        let mut expected = 0u8;
        let mut out = [0u8; 64];
        while received < total {
            let n = rx.read(&mut out);
            for &byte in &out[..n] {
                assert_eq!(byte, expected);
                expected = expected.wrapping_add(1);
            }
            received += n;
            if n == 0 {
                std::thread::yield_now();
            }
        }

        producer.join().unwrap();
        assert_eq!(received, total);
    }
}
