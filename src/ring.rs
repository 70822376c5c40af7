use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct Slot<V> {
    /// Set by the producer once the value is in place, cleared by the
    /// consumer once it has been moved out. Cursor uniqueness makes the
    /// owners of a slot strictly alternate, so one bit is enough.
    ready: AtomicBool,
    val: UnsafeCell<MaybeUninit<V>>,
}

/// A bounded ring buffer safe for concurrent producers and consumers.
///
/// Both cursors advance only by CAS: the winning tail CAS reserves a slot
/// for exactly one producer, the slot's `ready` stamp publishes the written
/// value, and the winning head CAS hands a published slot to exactly one
/// consumer. One slot is sacrificed to tell a full buffer from an empty
/// one, so a buffer of capacity `n` holds at most `n - 1` values.
///
/// A full `offer` returns `false` and an empty `poll` returns `None`; both
/// are ordinary outcomes. `len` is advisory only.
pub struct RingBuffer<V> {
    slots: Box<[Slot<V>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    capacity: usize,
}

unsafe impl<V: Send> Send for RingBuffer<V> {}
unsafe impl<V: Send> Sync for RingBuffer<V> {}

impl<V> RingBuffer<V> {
    /// Allocates a ring of `capacity` slots, of which `capacity - 1` are
    /// usable.
    ///
    /// # Panics
    ///
    /// Panics if `capacity < 2`, which could never store a value.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring buffer needs at least two slots");

        let slots = (0..capacity)
            .map(|_| Slot {
                ready: AtomicBool::new(false),
                val: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        RingBuffer {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Attempts to publish `val`; returns `false` if the buffer is full.
    pub fn offer(&self, val: V) -> bool {
        let mut tail = self.tail.load(Ordering::Relaxed);

        loop {
            // The fullness check runs against a freshly read head on every
            // attempt.
            let head = self.head.load(Ordering::Acquire);
            let next = (tail + 1) % self.capacity;

            if next == head {
                // Full -- unless our tail snapshot is stale.
                let now = self.tail.load(Ordering::Relaxed);
                if now == tail {
                    return false;
                }
                tail = now;
                continue;
            }

            match self.tail.compare_exchange_weak(
                tail,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let slot = &self.slots[tail];

                    // The previous lap's consumer may still be moving the
                    // old value out; wait for it to vacate.
                    while slot.ready.load(Ordering::Acquire) {
                        core::hint::spin_loop();
                    }

                    unsafe {
                        (*slot.val.get()).write(val);
                    }
                    slot.ready.store(true, Ordering::Release);

                    return true;
                }
                Err(now) => tail = now,
            }
        }
    }

    /// Takes the oldest value, or `None` if the buffer is empty.
    pub fn poll(&self) -> Option<V> {
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            let tail = self.tail.load(Ordering::Acquire);

            if head == tail {
                // Empty -- unless our head snapshot is stale.
                let now = self.head.load(Ordering::Relaxed);
                if now == head {
                    return None;
                }
                head = now;
                continue;
            }

            let next = (head + 1) % self.capacity;

            match self.head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let slot = &self.slots[head];

                    // The producer that reserved this slot may not have
                    // published yet.
                    while !slot.ready.load(Ordering::Acquire) {
                        core::hint::spin_loop();
                    }

                    let val = unsafe { (*slot.val.get()).assume_init_read() };
                    slot.ready.store(false, Ordering::Release);

                    return Some(val);
                }
                Err(now) => head = now,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        (tail + 1) % self.capacity == head
    }

    /// Advisory occupancy, in `0..capacity`. May be stale the instant it
    /// returns; use it for metrics, never to gate an `offer` or `poll`.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        (tail + self.capacity - head) % self.capacity
    }
}

impl<V> Drop for RingBuffer<V> {
    fn drop(&mut self) {
        // Exclusive access: published values that were never polled still
        // own their payload.
        for slot in self.slots.iter_mut() {
            if *slot.ready.get_mut() {
                unsafe {
                    slot.val.get_mut().assume_init_drop();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_offer_poll_order() {
        let ring = RingBuffer::with_capacity(4);

        assert!(ring.offer(1));
        assert!(ring.offer(2));
        assert_eq!(ring.poll(), Some(1));
        assert_eq!(ring.poll(), Some(2));
        assert_eq!(ring.poll(), None);
    }

    #[test]
    fn test_full() {
        let ring = RingBuffer::with_capacity(4);

        assert!(ring.offer(1));
        assert!(ring.offer(2));
        assert!(ring.offer(3));
        assert!(!ring.offer(4), "one slot is sacrificed");
        assert!(ring.is_full());

        assert_eq!(ring.poll(), Some(1));
        assert!(ring.offer(4));
        assert_eq!(ring.poll(), Some(2));
        assert_eq!(ring.poll(), Some(3));
        assert_eq!(ring.poll(), Some(4));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_rejected_offer_keeps_contents() {
        let ring = RingBuffer::with_capacity(3);

        assert!(ring.offer("a"));
        assert!(ring.offer("b"));
        assert!(!ring.offer("x"));
        assert!(!ring.offer("y"));

        assert_eq!(ring.poll(), Some("a"));
        assert_eq!(ring.poll(), Some("b"));
        assert_eq!(ring.poll(), None);
    }

    #[test]
    fn test_len_bound() {
        let ring = RingBuffer::with_capacity(8);

        for i in 0..7 {
            assert!(ring.offer(i));
            assert!(ring.len() <= ring.capacity() - 1);
        }
        assert_eq!(ring.len(), 7);
        assert!(!ring.offer(7));
        assert_eq!(ring.len(), 7);
    }

    #[test]
    fn test_spsc_preserves_order() {
        let ring = Arc::new(RingBuffer::with_capacity(8));

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for i in 0..10_000u64 {
                    while !ring.offer(i) {
                        thread::yield_now();
                    }
                }
            })
        };

        let consumer = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut seen = Vec::with_capacity(10_000);
                while seen.len() < 10_000 {
                    if let Some(val) = ring.poll() {
                        seen.push(val);
                    }
                }
                seen
            })
        };

        producer.join().unwrap();
        let seen = consumer.join().unwrap();

        let expected: Vec<u64> = (0..10_000).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_mpmc_no_lost_or_duplicated() {
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 2_500;

        let ring = Arc::new(RingBuffer::with_capacity(16));
        let drained = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut producers = vec![];
        for id in 0..PRODUCERS {
            let ring = ring.clone();
            producers.push(thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let stamp = id * PER_PRODUCER + seq;
                    while !ring.offer(stamp) {
                        thread::yield_now();
                    }
                }
            }));
        }

        let mut consumers = vec![];
        for _ in 0..CONSUMERS {
            let ring = ring.clone();
            let drained = drained.clone();
            consumers.push(thread::spawn(move || {
                let mut seen = vec![];
                loop {
                    match ring.poll() {
                        Some(stamp) => seen.push(stamp),
                        None => {
                            // Producers hold their own Arc clones until
                            // they are done.
                            if Arc::strong_count(&ring) <= CONSUMERS + 1 && ring.is_empty() {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
                drained.lock().unwrap().extend(seen);
            }));
        }

        for producer in producers {
            producer.join().unwrap();
        }
        for consumer in consumers {
            consumer.join().unwrap();
        }

        let drained = drained.lock().unwrap();
        let unique: HashSet<u64> = drained.iter().copied().collect();
        assert_eq!(drained.len() as u64, PRODUCERS * PER_PRODUCER);
        assert_eq!(unique.len() as u64, PRODUCERS * PER_PRODUCER);
    }

    #[test]
    fn test_len_is_advisory_but_bounded() {
        let ring = Arc::new(RingBuffer::with_capacity(8));
        let done = Arc::new(AtomicBool::new(false));

        let churn = {
            let ring = ring.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    ring.offer(1);
                    ring.poll();
                }
            })
        };

        for _ in 0..100_000 {
            assert!(ring.len() < ring.capacity());
        }

        done.store(true, Ordering::Relaxed);
        churn.join().unwrap();
    }

    #[test]
    fn test_drop_owned_values() {
        let ring = RingBuffer::with_capacity(4);

        assert!(ring.offer(String::from("a")));
        assert!(ring.offer(String::from("b")));
        assert_eq!(ring.poll().as_deref(), Some("a"));
        // "b" is dropped with the ring
    }

    #[test]
    #[should_panic]
    fn test_capacity_too_small() {
        let _ = RingBuffer::<i32>::with_capacity(1);
    }
}
