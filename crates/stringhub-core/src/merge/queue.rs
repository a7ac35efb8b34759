//! Bounded metered queue feeding a sort engine.
//!
//! Many producer threads enqueue raw buffers; the engine's single worker
//! thread dequeues them. The queue is the only producer-visible blocking
//! point in the pipeline: when the bound is reached, `put` blocks until the
//! worker drains at least one slot (backpressure). Buffers are never
//! dropped.
//!
//! ## Design
//!
//! - Power-of-2 ring with bitmask indexing, cache-padded head/tail
//! - Producers serialize on a spin lock with exponential backoff; the
//!   consumer side is lock-free
//! - Spin → yield → park wait loops on both full and empty conditions
//! - A [`Meter`] hook observes bytes entering and leaving the queue

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

/// Default queue bound: matches the per-kind sorter inputs a hub sustains
/// between worker drains.
pub const DEFAULT_MAX_QUEUE: usize = 100_000;

/// Minimum queue bound.
pub const MIN_QUEUE: usize = 4;

/// Maximum queue bound.
pub const MAX_QUEUE: usize = 1 << 20;

/// Observer for bytes flowing through a queue.
///
/// `report_in` fires when a producer enqueues; `report_out` fires when the
/// worker dequeues. Implementations must be cheap and thread-safe; the
/// default [`DisabledMeter`] compiles to no-ops.
pub trait Meter: Send + Sync {
    /// A buffer of `size` bytes entered the queue.
    fn report_in(&self, size: usize);

    /// A buffer of `size` bytes left the queue.
    fn report_out(&self, size: usize);
}

/// Observer for bytes flowing through the sort stage, tagged with the
/// buffer's UTC timestamp so depth can be expressed in detector time.
pub trait UtcMeter: Send + Sync {
    /// A buffer of `size` bytes at time `utc` entered the sort.
    fn report_in(&self, size: usize, utc: i64);

    /// A buffer of `size` bytes at time `utc` left the sort.
    fn report_out(&self, size: usize, utc: i64);
}

/// No-op meter.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledMeter;

impl Meter for DisabledMeter {
    #[inline]
    fn report_in(&self, _size: usize) {}

    #[inline]
    fn report_out(&self, _size: usize) {}
}

impl UtcMeter for DisabledMeter {
    #[inline]
    fn report_in(&self, _size: usize, _utc: i64) {}

    #[inline]
    fn report_out(&self, _size: usize, _utc: i64) {}
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Buffers enqueued.
    pub puts: u64,
    /// Buffers dequeued.
    pub takes: u64,
    /// Times a producer found the queue full and had to wait.
    pub put_blocked: u64,
}

/// Pads a value to a cache line to prevent false sharing between the
/// producer- and consumer-owned indices.
#[repr(align(64))]
struct CachePadded<T>(T);

/// Internal counters.
struct StatsInner {
    puts: CachePadded<AtomicU64>,
    takes: CachePadded<AtomicU64>,
    put_blocked: AtomicU64,
}

/// Bounded blocking queue of raw buffers (many producers, one consumer).
pub struct MergeQueue {
    /// Ring storage.
    slots: Box<[UnsafeCell<MaybeUninit<Bytes>>]>,

    /// Consumer index. Cache-padded against tail.
    head: CachePadded<AtomicUsize>,

    /// Producer index. Cache-padded against head.
    tail: CachePadded<AtomicUsize>,

    /// Capacity mask (capacity - 1) for fast modulo.
    mask: usize,

    /// Producer serialization lock. 0 = unlocked, 1 = locked.
    push_lock: AtomicU8,

    /// Set once the queue is closed; producers fail, the consumer drains.
    closed: AtomicBool,

    stats: StatsInner,
}

// SAFETY: slot access is coordinated by the head/tail indices plus the
// producer push lock; Bytes is Send.
unsafe impl Send for MergeQueue {}
// SAFETY: as above; producers never touch slots the consumer owns and
// vice versa.
unsafe impl Sync for MergeQueue {}

impl MergeQueue {
    /// Creates a queue with the given bound.
    ///
    /// The bound is clamped to `[MIN_QUEUE, MAX_QUEUE]` and rounded up to
    /// the next power of 2.
    #[must_use]
    pub fn new(bound: usize) -> Self {
        let capacity = bound.clamp(MIN_QUEUE, MAX_QUEUE).next_power_of_two();

        let slots: Vec<UnsafeCell<MaybeUninit<Bytes>>> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            mask: capacity - 1,
            push_lock: AtomicU8::new(0),
            closed: AtomicBool::new(false),
            stats: StatsInner {
                puts: CachePadded(AtomicU64::new(0)),
                takes: CachePadded(AtomicU64::new(0)),
                put_blocked: AtomicU64::new(0),
            },
        }
    }

    /// Returns the queue capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Returns the current queue depth (a racy snapshot).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        tail.wrapping_sub(head) & self.mask
    }

    /// Returns true if the queue is empty (a racy snapshot).
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.0.load(Ordering::Relaxed) == self.tail.0.load(Ordering::Relaxed)
    }

    /// Returns true once [`MergeQueue::close`] has been called.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the queue. Pending `put` calls fail; `take` drains what
    /// remains and then reports disconnection.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns a snapshot of the queue counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            puts: self.stats.puts.0.load(Ordering::Relaxed),
            takes: self.stats.takes.0.load(Ordering::Relaxed),
            put_blocked: self.stats.put_blocked.load(Ordering::Relaxed),
        }
    }

    /// Enqueues a buffer, blocking while the queue is full.
    ///
    /// The buffer's size is reported to the meter before queueing so that
    /// byte depth includes buffers waiting on backpressure.
    ///
    /// # Errors
    ///
    /// Returns the buffer back if the queue has been closed.
    pub fn put(&self, buf: Bytes, meter: &dyn Meter) -> Result<(), Bytes> {
        meter.report_in(buf.len());
        let mut item = buf;
        loop {
            if self.is_closed() {
                return Err(item);
            }
            match self.try_push(item) {
                Ok(()) => {
                    self.stats.puts.0.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(rejected) => {
                    item = rejected;
                    self.stats.put_blocked.fetch_add(1, Ordering::Relaxed);
                    self.wait_not_full();
                }
            }
        }
    }

    /// Dequeues the next buffer, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    #[must_use]
    pub fn take(&self, meter: &dyn Meter) -> Option<Bytes> {
        loop {
            if let Some(buf) = self.try_pop() {
                self.stats.takes.0.fetch_add(1, Ordering::Relaxed);
                meter.report_out(buf.len());
                return Some(buf);
            }
            if self.is_closed() {
                return None;
            }
            self.wait_not_empty();
        }
    }

    fn try_push(&self, item: Bytes) -> Result<(), Bytes> {
        self.acquire_push_lock();

        let tail = self.tail.0.load(Ordering::Relaxed);
        let next_tail = tail.wrapping_add(1) & self.mask;

        // One slot stays reserved to distinguish full from empty.
        if next_tail == self.head.0.load(Ordering::Acquire) {
            self.release_push_lock();
            return Err(item);
        }

        // SAFETY: the push lock gives us exclusive producer access, the
        // consumer only reads slots below tail, and this slot is not yet
        // published.
        unsafe {
            (*self.slots[tail].get()).write(item);
        }
        self.tail.0.store(next_tail, Ordering::Release);

        self.release_push_lock();
        Ok(())
    }

    fn try_pop(&self) -> Option<Bytes> {
        let head = self.head.0.load(Ordering::Relaxed);
        if head == self.tail.0.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: head < tail means the slot was published by a producer
        // and will not be touched again until head advances past it.
        let item = unsafe { (*self.slots[head].get()).assume_init_read() };
        self.head
            .0
            .store(head.wrapping_add(1) & self.mask, Ordering::Release);
        Some(item)
    }

    /// Spin with exponential backoff: spin, then yield, then briefly sleep.
    fn acquire_push_lock(&self) {
        let mut attempts = 0u32;
        while self
            .push_lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            attempts = attempts.saturating_add(1);
            if attempts <= 4 {
                std::hint::spin_loop();
            } else if attempts <= 8 {
                thread::yield_now();
            } else {
                let sleep_us = (1u64 << (attempts - 8).min(6)).min(100);
                thread::sleep(Duration::from_micros(sleep_us));
            }
        }
    }

    #[inline]
    fn release_push_lock(&self) {
        self.push_lock.store(0, Ordering::Release);
    }

    fn wait_not_full(&self) {
        let mut spins = 0;
        loop {
            let head = self.head.0.load(Ordering::Acquire);
            let tail = self.tail.0.load(Ordering::Relaxed);
            if tail.wrapping_add(1) & self.mask != head || self.is_closed() {
                return;
            }
            if spins < 100 {
                std::hint::spin_loop();
                spins += 1;
            } else {
                thread::park_timeout(Duration::from_micros(100));
            }
        }
    }

    fn wait_not_empty(&self) {
        let mut spins = 0;
        while self.is_empty() && !self.is_closed() {
            if spins < 100 {
                std::hint::spin_loop();
                spins += 1;
            } else {
                thread::park_timeout(Duration::from_micros(100));
            }
        }
    }
}

impl Drop for MergeQueue {
    fn drop(&mut self) {
        // Drain any published-but-untaken buffers so their storage is freed.
        while self.try_pop().is_some() {}
    }
}

impl std::fmt::Debug for MergeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingMeter {
        bytes_in: AtomicUsize,
        bytes_out: AtomicUsize,
    }

    impl Meter for CountingMeter {
        fn report_in(&self, size: usize) {
            self.bytes_in.fetch_add(size, Ordering::Relaxed);
        }

        fn report_out(&self, size: usize) {
            self.bytes_out.fetch_add(size, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_put_take_fifo() {
        let q = MergeQueue::new(16);
        let meter = DisabledMeter;

        q.put(Bytes::from_static(b"a"), &meter).unwrap();
        q.put(Bytes::from_static(b"bb"), &meter).unwrap();
        q.put(Bytes::from_static(b"ccc"), &meter).unwrap();
        assert_eq!(q.len(), 3);

        assert_eq!(q.take(&meter).unwrap(), Bytes::from_static(b"a"));
        assert_eq!(q.take(&meter).unwrap(), Bytes::from_static(b"bb"));
        assert_eq!(q.take(&meter).unwrap(), Bytes::from_static(b"ccc"));
        assert!(q.is_empty());
    }

    #[test]
    fn test_capacity_rounded_and_clamped() {
        assert_eq!(MergeQueue::new(10).capacity(), 16);
        assert_eq!(MergeQueue::new(0).capacity(), MIN_QUEUE);
    }

    #[test]
    fn test_meter_observes_bytes() {
        let q = MergeQueue::new(8);
        let meter = CountingMeter::default();

        q.put(Bytes::from_static(b"12345"), &meter).unwrap();
        assert_eq!(meter.bytes_in.load(Ordering::Relaxed), 5);
        assert_eq!(meter.bytes_out.load(Ordering::Relaxed), 0);

        let _ = q.take(&meter).unwrap();
        assert_eq!(meter.bytes_out.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_closed_queue_rejects_put_and_drains() {
        let q = MergeQueue::new(8);
        let meter = DisabledMeter;

        q.put(Bytes::from_static(b"x"), &meter).unwrap();
        q.close();

        assert!(q.put(Bytes::from_static(b"y"), &meter).is_err());
        assert_eq!(q.take(&meter).unwrap(), Bytes::from_static(b"x"));
        assert!(q.take(&meter).is_none());
    }

    #[test]
    fn test_backpressure_blocks_until_drained() {
        // Capacity 4 = 3 usable slots.
        let q = Arc::new(MergeQueue::new(4));
        let meter = DisabledMeter;

        for _ in 0..3 {
            q.put(Bytes::from_static(b"z"), &meter).unwrap();
        }

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                // Blocks until the consumer below makes room.
                q.put(Bytes::from_static(b"blocked"), &DisabledMeter)
                    .unwrap();
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.stats().puts, 3);

        let _ = q.take(&meter).unwrap();
        producer.join().unwrap();
        assert_eq!(q.stats().puts, 4);
        assert!(q.stats().put_blocked >= 1);
    }

    #[test]
    fn test_concurrent_producers() {
        const PER_PRODUCER: usize = 2000;
        const PRODUCERS: usize = 4;

        let q = Arc::new(MergeQueue::new(64));
        let mut handles = Vec::new();
        for _ in 0..PRODUCERS {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for _ in 0..PER_PRODUCER {
                    q.put(Bytes::from_static(b"item"), &DisabledMeter).unwrap();
                }
            }));
        }

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for _ in 0..PER_PRODUCER * PRODUCERS {
                    assert!(q.take(&DisabledMeter).is_some());
                }
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        consumer.join().unwrap();

        let stats = q.stats();
        assert_eq!(stats.puts, (PER_PRODUCER * PRODUCERS) as u64);
        assert_eq!(stats.takes, (PER_PRODUCER * PRODUCERS) as u64);
    }
}
