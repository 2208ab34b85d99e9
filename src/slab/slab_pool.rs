//! Fixed-size object pool over a chain of bitmap-tracked slabs.

use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::error;

use super::span::Slab;
use crate::{AllocResult, BackingAllocator};

/// Pool handing out slots of a single type `T` in amortized O(1).
///
/// Storage is a singly linked chain of slabs, each one backing span holding
/// `WORDS * 64` slots plus an occupancy bitmap. Allocation takes the lowest
/// free slot of the first slab with room; when every slab is full a fresh
/// one is appended at the tail. Slabs are only returned to the backing
/// source when the pool is dropped.
///
/// Slots are handed out uninitialized and the pool never runs `T`'s drop
/// glue; callers own the slot contents for as long as they hold the pointer.
pub struct SlabPool<T, MA: BackingAllocator, const WORDS: usize = 64> {
    backing: MA,
    // First slab span in the chain; never 0 once constructed.
    head: usize,
    slots_in_use: usize,
    num_slabs: usize,
    #[cfg(feature = "tracking")]
    total_allocations: usize,
    #[cfg(feature = "tracking")]
    total_deallocations: usize,
    _marker: PhantomData<T>,
}

/// Cumulative slab pool counters.
#[cfg(feature = "tracking")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SlabPoolStats {
    pub num_slabs: usize,
    pub slots_in_use: usize,
    pub total_allocations: usize,
    pub total_deallocations: usize,
}

impl<T, MA: BackingAllocator, const WORDS: usize> SlabPool<T, MA, WORDS> {
    /// Create a pool with one pre-allocated slab.
    ///
    /// # Panics
    ///
    /// Panics if the backing source cannot provide the first slab.
    pub fn new(mut backing: MA) -> Self {
        debug_assert!(mem::size_of::<T>() > 0);
        debug_assert!(mem::align_of::<T>() <= crate::ALIGNMENT_BOUNDARY);
        let head = match backing.allocate(Slab::<T, WORDS>::span_bytes()) {
            Ok(addr) => addr,
            Err(e) => panic!("slab pool: backing source failed during startup: {:?}", e),
        };
        Slab::<T, WORDS>::new(head).init();
        Self {
            backing,
            head,
            slots_in_use: 0,
            num_slabs: 1,
            #[cfg(feature = "tracking")]
            total_allocations: 0,
            #[cfg(feature = "tracking")]
            total_deallocations: 0,
            _marker: PhantomData,
        }
    }

    /// First slab with a free slot, appending a new tail slab if all are full.
    fn find_or_grow(&mut self) -> AllocResult<Slab<T, WORDS>> {
        let mut curr = self.head;
        let mut tail = self.head;
        while curr != 0 {
            let slab = Slab::<T, WORDS>::new(curr);
            if slab.free_count() > 0 {
                return Ok(slab);
            }
            tail = curr;
            curr = slab.next();
        }

        let span = self.backing.allocate(Slab::<T, WORDS>::span_bytes())?;
        let mut fresh = Slab::<T, WORDS>::new(span);
        fresh.init();
        Slab::<T, WORDS>::new(tail).set_next(span);
        self.num_slabs += 1;
        Ok(fresh)
    }

    /// Hand out the lowest free slot, growing the chain if needed.
    pub fn try_allocate(&mut self) -> AllocResult<NonNull<T>> {
        let mut slab = self.find_or_grow()?;
        let index = match slab.claim_first_free() {
            Some(index) => index,
            None => panic!("slab pool: slab with free_count > 0 had no free bit, bitmap inconsistency detected"),
        };
        self.slots_in_use += 1;
        #[cfg(feature = "tracking")]
        {
            self.total_allocations += 1;
        }
        Ok(unsafe { NonNull::new_unchecked(slab.slot_addr(index) as *mut T) })
    }

    /// Like [`try_allocate`](Self::try_allocate), but treats backing
    /// exhaustion as fatal.
    pub fn allocate(&mut self) -> NonNull<T> {
        match self.try_allocate() {
            Ok(ptr) => ptr,
            Err(e) => panic!("slab pool: backing source exhausted: {:?}", e),
        }
    }

    /// Return a slot to the pool.
    ///
    /// A pointer that belongs to no slab, or a slot that is already free,
    /// is reported and otherwise ignored.
    pub fn deallocate(&mut self, ptr: NonNull<T>) {
        let addr = ptr.as_ptr() as usize;
        let mut curr = self.head;
        while curr != 0 {
            let mut slab = Slab::<T, WORDS>::new(curr);
            if slab.contains(addr) {
                match slab.slot_index_of(addr) {
                    Some(index) => {
                        if !slab.release_slot(index) {
                            error!("slab pool: double free of slot at {:#x}", addr);
                            return;
                        }
                        self.slots_in_use -= 1;
                        #[cfg(feature = "tracking")]
                        {
                            self.total_deallocations += 1;
                        }
                    }
                    None => {
                        error!("slab pool: pointer {:#x} does not lie on a slot boundary", addr);
                    }
                }
                return;
            }
            curr = slab.next();
        }
        error!("slab pool: pointer {:#x} does not belong to any slab", addr);
    }

    /// Bytes handed out to callers: slots in use times the slot size.
    pub fn allocated_size(&self) -> usize {
        self.slots_in_use * mem::size_of::<T>()
    }

    /// Bytes held from the backing source.
    pub fn total_size(&self) -> usize {
        self.num_slabs * Slab::<T, WORDS>::span_bytes()
    }

    pub fn num_slabs(&self) -> usize {
        self.num_slabs
    }

    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> SlabPoolStats {
        SlabPoolStats {
            num_slabs: self.num_slabs,
            slots_in_use: self.slots_in_use,
            total_allocations: self.total_allocations,
            total_deallocations: self.total_deallocations,
        }
    }
}

impl<T, MA: BackingAllocator, const WORDS: usize> Drop for SlabPool<T, MA, WORDS> {
    fn drop(&mut self) {
        let mut curr = self.head;
        while curr != 0 {
            let next = Slab::<T, WORDS>::new(curr).next();
            self.backing.deallocate(curr);
            curr = next;
        }
    }
}
