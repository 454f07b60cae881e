//! Fixed-layout composite region placed at the start of every channel mapping
//!
//! ```text
//! ┌──────────────┬───────────────┬────────────────┬──────────────────────┐
//! │ RegionHeader │ N × PshMutex  │ N × PshCondVar │ BoundedQueue<T, CAP> │
//! └──────────────┴───────────────┴────────────────┴──────────────────────┘
//! ```
//!
//! Slot `i` pairs mutex `i` with condition variable `i`. The header is
//! published last, so an attacher that sees `ready` also sees initialized
//! primitives.

use crate::error::{ShmError, ShmResult};
use crate::queue::{BoundedQueue, ShmElement};
use crate::sync::{PshCondVar, PshMutex};
use static_assertions::{assert_eq_size, const_assert_eq};
use std::mem::size_of;
use std::ptr::{addr_of, addr_of_mut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Marker stored in every initialized header ("SHMCHAN1")
pub const REGION_MAGIC: u64 = u64::from_le_bytes(*b"SHMCHAN1");

/// Revision of the region layout
pub const LAYOUT_VERSION: u32 = 1;

/// Region metadata written by the creator
#[repr(C, align(64))]
pub struct RegionHeader {
    magic: AtomicU64,
    layout_version: AtomicU32,
    ready: AtomicU32,
    layout_size: AtomicU64,
    generation: AtomicU64,
}

const_assert_eq!(size_of::<RegionHeader>(), 64);
assert_eq_size!(PshMutex, libc::pthread_mutex_t);
assert_eq_size!(PshCondVar, libc::pthread_cond_t);

impl RegionHeader {
    fn is_published(&self) -> bool {
        self.ready.load(Ordering::Acquire) != 0 && self.magic.load(Ordering::Relaxed) == REGION_MAGIC
    }

    /// Number of times the region has been initialized
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Composite queue region: header, `N` synchronization slots and a queue of
/// `CAP` elements of type `T`
#[repr(C)]
pub struct ShmQueue<T: ShmElement, const CAP: usize, const N: usize> {
    header: RegionHeader,
    mutexes: [PshMutex; N],
    conds: [PshCondVar; N],
    queue: BoundedQueue<T, CAP>,
}

impl<T: ShmElement, const CAP: usize, const N: usize> ShmQueue<T, CAP, N> {
    /// Bytes the region occupies in the mapping
    pub const LAYOUT_SIZE: usize = size_of::<Self>();

    /// Zero the region and initialize every primitive and the queue,
    /// returning the new generation.
    ///
    /// The generation continues from the one found in a previously published
    /// header, so handles attached before can tell they are stale.
    ///
    /// # Safety
    ///
    /// `this` must point to at least [`Self::LAYOUT_SIZE`] mapped, writable
    /// and suitably aligned bytes. Any process still using the old contents
    /// observes them being wiped.
    pub unsafe fn initialize(this: *mut Self) -> ShmResult<u64> {
        let previous = unsafe {
            let header = &*addr_of!((*this).header);
            if header.is_published() {
                header.generation()
            } else {
                0
            }
        };

        unsafe {
            std::ptr::write_bytes(this.cast::<u8>(), 0, Self::LAYOUT_SIZE);

            let conds = addr_of_mut!((*this).conds).cast::<PshCondVar>();
            for i in 0..N {
                PshCondVar::init_in_place(conds.add(i))?;
            }
            BoundedQueue::init_in_place(addr_of_mut!((*this).queue));
            let mutexes = addr_of_mut!((*this).mutexes).cast::<PshMutex>();
            for i in 0..N {
                PshMutex::init_in_place(mutexes.add(i))?;
            }
        }

        let generation = previous.wrapping_add(1);
        let header = unsafe { &*addr_of!((*this).header) };
        header.magic.store(REGION_MAGIC, Ordering::Relaxed);
        header.layout_version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.layout_size.store(Self::LAYOUT_SIZE as u64, Ordering::Relaxed);
        header.generation.store(generation, Ordering::Relaxed);
        header.ready.store(1, Ordering::Release);

        debug!(
            "Initialized region: {} bytes, {} slots, capacity {}, generation {}",
            Self::LAYOUT_SIZE,
            N,
            CAP,
            generation
        );
        Ok(generation)
    }

    /// Check that a creator published this region with a matching layout,
    /// returning its generation.
    pub fn validate(&self, name: &str) -> ShmResult<u64> {
        if !self.header.is_published() {
            return Err(ShmError::NotInitialized {
                name: name.to_string(),
            });
        }

        let found = self.header.layout_size.load(Ordering::Relaxed);
        let version = self.header.layout_version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION || found != Self::LAYOUT_SIZE as u64 {
            return Err(ShmError::LayoutMismatch {
                name: name.to_string(),
                expected: Self::LAYOUT_SIZE as u64,
                found,
            });
        }
        Ok(self.header.generation())
    }

    /// Region header
    pub fn header(&self) -> &RegionHeader {
        &self.header
    }

    /// Current generation of the region
    pub fn generation(&self) -> u64 {
        self.header.generation()
    }

    /// Embedded queue
    pub fn queue(&self) -> &BoundedQueue<T, CAP> {
        &self.queue
    }

    /// Mutex of slot `slot`
    pub fn mutex(&self, slot: usize) -> Option<&PshMutex> {
        self.mutexes.get(slot)
    }

    /// Condition variable of slot `slot`
    pub fn cond(&self, slot: usize) -> Option<&PshCondVar> {
        self.conds.get(slot)
    }

    /// Number of mutex/condition variable slots
    pub const fn slots(&self) -> usize {
        N
    }

    /// See [`BoundedQueue::try_push`]
    pub fn try_push(&self, value: T) -> Result<(), T> {
        self.queue.try_push(value)
    }

    /// See [`BoundedQueue::try_pop`]
    pub fn try_pop(&self) -> Option<T> {
        self.queue.try_pop()
    }

    /// See [`BoundedQueue::push`]
    pub fn push(&self, value: T) {
        self.queue.push(value)
    }

    /// See [`BoundedQueue::pop`]
    pub fn pop(&self) -> T {
        self.queue.pop()
    }

    /// See [`BoundedQueue::len`]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// See [`BoundedQueue::is_empty`]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Fixed queue capacity
    pub const fn capacity(&self) -> usize {
        CAP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::CondVar;

    type TestRegion = ShmQueue<u32, 16, 2>;

    fn zeroed_region() -> Box<TestRegion> {
        // SAFETY: all-zero bytes are a valid (unpublished) region on Linux:
        // atomics at zero and statically-initialized pthread objects.
        unsafe { Box::<TestRegion>::new_zeroed().assume_init() }
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(size_of::<RegionHeader>(), 64);
        assert_eq!(std::mem::align_of::<TestRegion>() % 64, 0);
        assert!(TestRegion::LAYOUT_SIZE > size_of::<BoundedQueue<u32, 16>>());
    }

    #[test]
    fn test_unpublished_region_rejected() {
        let region = zeroed_region();
        assert!(matches!(
            region.validate("fresh"),
            Err(ShmError::NotInitialized { .. })
        ));
    }

    #[test]
    fn test_initialize_publishes_and_counts_generations() {
        let mut region = zeroed_region();
        let ptr: *mut TestRegion = &mut *region;

        assert_eq!(unsafe { TestRegion::initialize(ptr) }.unwrap(), 1);
        assert_eq!(region.validate("gen").unwrap(), 1);

        region.try_push(42).unwrap();
        assert_eq!(region.len(), 1);

        let ptr: *mut TestRegion = &mut *region;
        assert_eq!(unsafe { TestRegion::initialize(ptr) }.unwrap(), 2);
        assert_eq!(region.generation(), 2);
        assert!(region.is_empty());
    }

    #[test]
    fn test_layout_size_mismatch() {
        let mut region = zeroed_region();
        let ptr: *mut TestRegion = &mut *region;
        unsafe { TestRegion::initialize(ptr) }.unwrap();

        region.header.layout_size.store(8, Ordering::Relaxed);
        match region.validate("resized") {
            Err(ShmError::LayoutMismatch {
                expected, found, ..
            }) => {
                assert_eq!(expected, TestRegion::LAYOUT_SIZE as u64);
                assert_eq!(found, 8);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_slots_are_usable() {
        let mut region = zeroed_region();
        let ptr: *mut TestRegion = &mut *region;
        unsafe { TestRegion::initialize(ptr) }.unwrap();

        assert_eq!(region.slots(), 2);
        assert!(region.mutex(2).is_none());
        let guard = region.mutex(1).unwrap().lock().unwrap();
        region.cond(1).unwrap().notify_all().unwrap();
        drop(guard);
        assert!(region.mutex(1).unwrap().try_lock().unwrap().is_some());
    }
}
