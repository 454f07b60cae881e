//! Bounded MPMC queue that lives entirely inside a shared mapping
//!
//! Every cell carries its own sequence number, so producers and consumers in
//! different address spaces coordinate through atomics on the mapped bytes
//! alone. The queue holds no pointers, owns no heap memory and is brought to
//! life with [`BoundedQueue::init_in_place`] on memory it does not own.

use crossbeam_utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, Ordering};

/// Element types that may travel through shared memory.
///
/// # Safety
///
/// Implementors must be plain data: no pointers, references or handles that
/// only mean something inside one process, and no drop glue. The value is
/// copied bit for bit into a region other processes read.
pub unsafe trait ShmElement: Copy + Send + 'static {}

macro_rules! impl_shm_element {
    ($($ty:ty),* $(,)?) => {
        $(unsafe impl ShmElement for $ty {})*
    };
}

impl_shm_element!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, ()
);

unsafe impl<T: ShmElement, const N: usize> ShmElement for [T; N] {}

#[repr(C)]
struct Cell<T> {
    sequence: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity FIFO queue safe for any number of producers and consumers.
///
/// `CAP` must be a power of two; other values fail to compile as soon as the
/// queue is used.
#[repr(C)]
pub struct BoundedQueue<T: ShmElement, const CAP: usize> {
    enqueue_pos: CachePadded<AtomicU64>,
    dequeue_pos: CachePadded<AtomicU64>,
    cells: [Cell<T>; CAP],
}

// SAFETY: values move between threads only through the sequence protocol,
// which hands each cell to exactly one producer or consumer at a time.
unsafe impl<T: ShmElement, const CAP: usize> Send for BoundedQueue<T, CAP> {}
unsafe impl<T: ShmElement, const CAP: usize> Sync for BoundedQueue<T, CAP> {}

impl<T: ShmElement, const CAP: usize> BoundedQueue<T, CAP> {
    const MASK: u64 = {
        assert!(CAP.is_power_of_two(), "queue capacity must be a power of two");
        (CAP - 1) as u64
    };

    /// Bring an empty queue to life in place.
    ///
    /// # Safety
    ///
    /// `this` must be valid for writes of `size_of::<Self>()` bytes, suitably
    /// aligned, and not accessed by anyone else until this returns.
    pub unsafe fn init_in_place(this: *mut Self) {
        let _ = Self::MASK;
        unsafe {
            addr_of_mut!((*this).enqueue_pos).write(CachePadded::new(AtomicU64::new(0)));
            addr_of_mut!((*this).dequeue_pos).write(CachePadded::new(AtomicU64::new(0)));
            let cells = addr_of_mut!((*this).cells).cast::<Cell<T>>();
            for i in 0..CAP {
                addr_of_mut!((*cells.add(i)).sequence).write(AtomicU64::new(i as u64));
            }
        }
    }

    /// Heap-allocated queue, for use within a single process
    pub fn boxed() -> Box<Self> {
        let mut slot = Box::<Self>::new_uninit();
        // SAFETY: fresh allocation; every field is written by init_in_place
        // and cell values are MaybeUninit.
        unsafe {
            Self::init_in_place(slot.as_mut_ptr());
            slot.assume_init()
        }
    }

    /// Enqueue `value`, handing it back if the queue is full
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[(pos & Self::MASK) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as i64;

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the successful CAS gives this producer sole
                        // ownership of the cell until the sequence is bumped.
                        unsafe { (*cell.value.get()).write(value) };
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue the oldest element, `None` if the queue is empty
    pub fn try_pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[(pos & Self::MASK) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as i64;

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the producer published this cell with the
                        // Release store observed above.
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.sequence
                            .store(pos.wrapping_add(Self::MASK + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueue `value`, spinning with backoff while the queue is full
    pub fn push(&self, mut value: T) {
        let backoff = Backoff::new();
        loop {
            match self.try_push(value) {
                Ok(()) => return,
                Err(rejected) => {
                    value = rejected;
                    backoff.snooze();
                }
            }
        }
    }

    /// Dequeue an element, spinning with backoff while the queue is empty
    pub fn pop(&self) -> T {
        let backoff = Backoff::new();
        loop {
            if let Some(value) = self.try_pop() {
                return value;
            }
            backoff.snooze();
        }
    }

    /// Number of queued elements; a snapshot under concurrent use
    ///
    /// The tail is re-read until it did not move around the head load, so
    /// head and tail form a consistent pair and the count never exceeds
    /// what was actually queued.
    pub fn len(&self) -> usize {
        loop {
            let tail = self.enqueue_pos.load(Ordering::SeqCst);
            let head = self.dequeue_pos.load(Ordering::SeqCst);
            if self.enqueue_pos.load(Ordering::SeqCst) == tail {
                return (tail.wrapping_sub(head) as usize).min(CAP);
            }
        }
    }

    /// Whether the queue currently holds no element
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a push would currently be rejected
    pub fn is_full(&self) -> bool {
        self.len() == CAP
    }

    /// Fixed capacity
    pub const fn capacity(&self) -> usize {
        CAP
    }
}
