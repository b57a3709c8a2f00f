//! Interrupt-to-worker event plumbing.
//!
//! The interrupt handler records what happened and returns; the worker
//! drains the queues and does the actual schedule walking.  Each queue
//! has exactly one producer (the ISR) and one consumer (the worker),
//! so a lock-free single-producer single-consumer ring is enough.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};

/// Condensed interrupt cause, recorded by the ISR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcEvent {
    /// Transfer advance: at least one descriptor retired.
    TransferDone,
    /// A transaction error or halt was flagged.
    TransferError,
    /// The async-advance doorbell rang.
    AsyncAdvanced,
    /// FRINDEX wrapped; extend the software frame counter.
    FrameRollover,
    /// Fatal host system error; the controller has stopped.
    HostSystemError,
}

/// Root-port status change, after debounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Attach { port: u8 },
    Detach { port: u8 },
}

/// Single-producer single-consumer event ring.
///
/// Capacity `N` must be a power of two.  `try_send` and `try_recv`
/// never block; a full ring drops the new event (the producer counts
/// drops so the worker can report them).
pub struct SpscQueue<T: Copy, const N: usize> {
    head: AtomicU32,
    tail: AtomicU32,
    elems: UnsafeCell<[MaybeUninit<T>; N]>,
}

unsafe impl<T: Copy + Send, const N: usize> Sync for SpscQueue<T, N> {}

impl<T: Copy, const N: usize> SpscQueue<T, N> {
    const CAPACITY_POW2: () = assert!(N.is_power_of_two());

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::CAPACITY_POW2;
        SpscQueue {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            elems: UnsafeCell::new([MaybeUninit::uninit(); N]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Enqueue from the single producer.
    ///
    /// # Safety
    ///
    /// Only one thread of execution may act as producer at a time.
    pub unsafe fn try_send(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) as usize >= N {
            return Err(value);
        }
        let idx = tail as usize % N;
        unsafe {
            (*self.elems.get())[idx].write(value);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeue from the single consumer.
    ///
    /// # Safety
    ///
    /// Only one thread of execution may act as consumer at a time.
    pub unsafe fn try_recv(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = head as usize % N;
        let value = unsafe { (*self.elems.get())[idx].assume_init() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}
