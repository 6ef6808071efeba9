//! embedded-datalog - the ring log buffer
//!
//! A fixed-capacity circular byte buffer sitting between the burst-rate
//! event producers and the slow, highly variable filesystem write path.
//! Producers run in task context or interrupt context, possibly on another
//! core; the single consumer is the log-file controller task.
//!
//! All cursor mutation happens inside a `critical_section` acquire, which
//! the platform backs with a primitive that is safe to take from interrupt
//! context on any core (a hardware spinlock on dual-core parts). The
//! consumer reads `head` outside the lock: a stale value is only ever a
//! lower bound on the bytes available, which is always safe.
//!
//! Appends are atomic: either the whole entry becomes visible in one step,
//! or nothing is written and a drop is counted. Producers never block and
//! never overwrite - under sustained overload the buffer is lossy by
//! design, with the drop counter there for diagnosis.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// The most bytes a task-context [`append`](RingLog::append) may carry
/// (tag byte included). Keeps the time spent holding the cross-core lock
/// bounded.
pub const MAX_APPEND: usize = 64;

/// A byte ring shared between interrupt-context producers, task-context
/// producers and one consumer. `N` must be a power of two.
pub struct RingLog<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    /// Next write position. Free-running; advanced only by producers,
    /// always from inside the critical section.
    head: AtomicU32,
    /// Next read position. Free-running; advanced only by the consumer.
    tail: AtomicU32,
    /// Appends rejected because the buffer was full (or malformed).
    dropped: AtomicU32,
    consumer_claimed: AtomicBool,
}

// The buffer cell is only touched by producers inside the critical section,
// and by the consumer in the [tail, head) region no producer will write.
unsafe impl<const N: usize> Sync for RingLog<N> {}

impl<const N: usize> RingLog<N> {
    const CAPACITY_IS_POWER_OF_TWO: () = assert!(N.is_power_of_two());

    /// Create an empty ring.
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::CAPACITY_IS_POWER_OF_TWO;
        RingLog {
            buf: UnsafeCell::new([0; N]),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
            consumer_claimed: AtomicBool::new(false),
        }
    }

    /// The fixed capacity in bytes.
    pub const fn capacity(&self) -> u32 {
        N as u32
    }

    /// How many appends have been rejected since boot.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Bytes currently buffered. Producer-side view, for diagnostics.
    pub fn bytes_in_use(&self) -> u32 {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Copy `bytes` in at `head`. Must only be called with the critical
    /// section held and space already checked; the caller publishes the
    /// new head once the whole entry is in place.
    ///
    /// The writes go through a raw pointer: the consumer may hold shared
    /// borrows into the `[tail, head)` region, which a `&mut` over the
    /// whole array would alias.
    unsafe fn push_unchecked(&self, head: u32, bytes: &[u8]) {
        let buf = self.buf.get() as *mut u8;
        for (i, &b) in bytes.iter().enumerate() {
            let idx = (head.wrapping_add(i as u32) as usize) & (N - 1);
            buf.add(idx).write(b);
        }
    }

    /// Append a packed 1-3 byte event from interrupt context.
    ///
    /// The low nibble of `word` is the payload length; the payload bytes
    /// sit in bits 8 and up. Safe to call from an ISR on either core; never
    /// blocks on the scheduler. Returns `false` (and counts a drop) if the
    /// word is malformed or space is insufficient.
    pub fn append_from_isr(&self, word: u32) -> bool {
        let len = (word & 0x0F) as usize;
        if len == 0 || len > 3 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let bytes = [
            (word >> 8) as u8,
            (word >> 16) as u8,
            (word >> 24) as u8,
        ];
        critical_section::with(|_cs| {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Relaxed);
            let free = N as u32 - head.wrapping_sub(tail);
            if (len as u32) > free {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            unsafe { self.push_unchecked(head, &bytes[..len]) };
            self.head
                .store(head.wrapping_add(len as u32), Ordering::Release);
            true
        })
    }

    /// Append a tag byte plus payload from task context.
    ///
    /// The critical section doubles as the preemption guard, so the region
    /// it covers is just the bounded copy: `payload` may be at most
    /// [`MAX_APPEND`] - 1 bytes. Returns `false` (and counts a drop) on an
    /// oversized payload or insufficient space; the entry is then not
    /// visible at all.
    pub fn append(&self, tag: u8, payload: &[u8]) -> bool {
        let total = 1 + payload.len();
        if total > MAX_APPEND {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        critical_section::with(|_cs| {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Relaxed);
            let free = N as u32 - head.wrapping_sub(tail);
            if (total as u32) > free {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            // The whole entry goes into the buffer before the single head
            // store, so the consumer sees all of it or none of it.
            unsafe {
                self.push_unchecked(head, &[tag]);
                self.push_unchecked(head.wrapping_add(1), payload);
            }
            self.head
                .store(head.wrapping_add(total as u32), Ordering::Release);
            true
        })
    }

    /// Take the consumer end. There is exactly one consumer system-wide;
    /// the second and later calls get `None`.
    pub fn claim_consumer(&self) -> Option<Consumer<'_, N>> {
        if self.consumer_claimed.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Consumer { ring: self })
        }
    }
}

impl<const N: usize> Default for RingLog<N> {
    fn default() -> Self {
        RingLog::new()
    }
}

/// What the log-file controller needs from the buffer it drains. A trait
/// so the controller can be exercised against a plain in-memory stub.
pub trait LogDrain {
    /// The fixed capacity of the buffer behind this drain.
    fn capacity(&self) -> u32;

    /// A lower bound on the bytes ready to be drained.
    fn bytes_available(&self) -> u32;

    /// Borrow up to `max_len` buffered bytes without consuming them. The
    /// second slice is non-empty only when the data wraps the physical end
    /// of the buffer.
    fn peek_slices(&self, max_len: u32) -> (&[u8], &[u8]);

    /// Consume `len` bytes. Call only after those bytes are durably
    /// committed; until then a failed write can be retried from the buffer.
    fn release(&mut self, len: u32);
}

/// The single consumer end of a [`RingLog`].
pub struct Consumer<'a, const N: usize> {
    ring: &'a RingLog<N>,
}

impl<'a, const N: usize> Consumer<'a, N> {
    fn snapshot(&self) -> (u32, u32) {
        // Acquire on head pairs with the producers' Release store, making
        // the payload bytes visible. Tail is ours alone.
        let head = self.ring.head.load(Ordering::Acquire);
        let tail = self.ring.tail.load(Ordering::Relaxed);
        (head, tail)
    }
}

impl<'a, const N: usize> LogDrain for Consumer<'a, N> {
    fn capacity(&self) -> u32 {
        N as u32
    }

    fn bytes_available(&self) -> u32 {
        let (head, tail) = self.snapshot();
        head.wrapping_sub(tail)
    }

    fn peek_slices(&self, max_len: u32) -> (&[u8], &[u8]) {
        let (head, tail) = self.snapshot();
        let avail = head.wrapping_sub(tail).min(max_len) as usize;
        let start = (tail as usize) & (N - 1);
        let first_len = avail.min(N - start);
        // Producers only ever write outside [tail, head), so these bytes
        // are stable until we release them.
        let buf = unsafe { &*self.ring.buf.get() };
        (
            &buf[start..start + first_len],
            &buf[..avail - first_len],
        )
    }

    fn release(&mut self, len: u32) {
        debug_assert!(len <= self.bytes_available());
        let tail = self.ring.tail.load(Ordering::Relaxed);
        self.ring
            .tail
            .store(tail.wrapping_add(len), Ordering::Release);
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
