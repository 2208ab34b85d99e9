//! Variable-size byte-region pool with best-fit search, splitting and
//! coalescing.
//!
//! The pool keeps two singly linked lists of [`Block`] metadata over the
//! spans it holds from the backing source: a free list sorted by address and
//! an unordered used list. Allocation picks the tightest free block, cutting
//! off the tail as a new free block when the fit is not exact; deallocation
//! reinserts the block at its sorted position and merges it with abutting
//! neighbors, never across a backing-span boundary.

use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, error};

use super::block::{Block, BlockIter};
#[cfg(feature = "tracking")]
use super::stats::RegionPoolStats;
use crate::slab::SlabPool;
use crate::{
    align_up, is_aligned, AllocError, AllocResult, BackingAllocator, ProcessHeap,
    ALIGNMENT_BOUNDARY,
};

/// Smallest span requested from the backing source on growth.
///
/// Large enough that splitting amortizes the backing round-trip, small
/// enough that a handful of tiny allocations does not balloon the
/// footprint.
pub const DEFAULT_MIN_BYTES: usize = 4096;

/// Pool of variable-length byte regions carved from backing spans.
///
/// `MA` backs the data spans; `IA` backs the metadata slab pool. The two are
/// separate so that the metadata path can stay on a heap primitive that is
/// not routed through this pool when it serves as the program allocator.
pub struct RegionPool<MA: BackingAllocator, IA: BackingAllocator = ProcessHeap> {
    // Metadata records for both lists live in this pool.
    block_pool: SlabPool<Block, IA>,
    backing: MA,
    // Heads of the used (unordered) and free (address-sorted) lists.
    used_head: usize,
    free_head: usize,
    // Bytes currently held from the backing source.
    total_bytes: usize,
    // Sum of the lengths of the used-list blocks.
    alloc_bytes: usize,
    min_bytes: usize,
    #[cfg(feature = "tracking")]
    total_allocations: usize,
    #[cfg(feature = "tracking")]
    total_deallocations: usize,
    #[cfg(feature = "tracking")]
    spans_from_backing: usize,
}

impl<MA: BackingAllocator, IA: BackingAllocator + Default> RegionPool<MA, IA> {
    /// Create an empty pool with the default growth floor of
    /// [`DEFAULT_MIN_BYTES`].
    pub fn new(backing: MA) -> Self {
        Self::with_min_bytes(backing, DEFAULT_MIN_BYTES)
    }

    /// Create an empty pool that never requests less than `min_bytes` from
    /// the backing source when it grows.
    pub fn with_min_bytes(backing: MA, min_bytes: usize) -> Self {
        Self::with_backings(backing, IA::default(), min_bytes)
    }
}

impl<MA: BackingAllocator, IA: BackingAllocator> RegionPool<MA, IA> {
    /// Create an empty pool with an explicit metadata backing.
    pub fn with_backings(backing: MA, metadata_backing: IA, min_bytes: usize) -> Self {
        Self {
            block_pool: SlabPool::new(metadata_backing),
            backing,
            used_head: 0,
            free_head: 0,
            total_bytes: 0,
            alloc_bytes: 0,
            min_bytes,
            #[cfg(feature = "tracking")]
            total_allocations: 0,
            #[cfg(feature = "tracking")]
            total_deallocations: 0,
            #[cfg(feature = "tracking")]
            spans_from_backing: 0,
        }
    }

    fn blk(&self, at: usize) -> &Block {
        debug_assert!(at != 0);
        unsafe { &*(at as *const Block) }
    }

    fn blk_mut(&mut self, at: usize) -> &mut Block {
        debug_assert!(at != 0);
        unsafe { &mut *(at as *mut Block) }
    }

    fn free_meta(&mut self, at: usize) {
        self.block_pool
            .deallocate(unsafe { NonNull::new_unchecked(at as *mut Block) });
    }

    /// Best-fit scan of the free list: the smallest block with `len >= size`
    /// whose start address satisfies `align`, first encountered on ties.
    /// Returns (block, predecessor), 0 for none.
    fn find_usable_block(&self, size: usize, align: usize) -> (usize, usize) {
        let mut best = 0;
        let mut best_prev = 0;
        let mut prev = 0;
        let mut iter = self.free_head;
        while iter != 0 {
            let b = self.blk(iter);
            if b.len >= size
                && is_aligned(b.addr, align)
                && (best == 0 || b.len < self.blk(best).len)
            {
                best = iter;
                best_prev = prev;
            }
            prev = iter;
            iter = b.next;
        }
        (best, best_prev)
    }

    /// Obtain a fresh span from the backing source and insert it into the
    /// free list, at its address-sorted position, as a head block.
    /// Returns (block, predecessor).
    fn grow(&mut self, size: usize) -> AllocResult<(usize, usize)> {
        let size_to_alloc = align_up(size, ALIGNMENT_BOUNDARY).max(self.min_bytes);
        let data = self.backing.allocate(size_to_alloc)?;
        debug_assert!(is_aligned(data, ALIGNMENT_BOUNDARY));

        let node = match self.block_pool.try_allocate() {
            Ok(node) => node,
            Err(e) => {
                // Undo the span acquisition so nothing is left untracked.
                self.backing.deallocate(data);
                return Err(e);
            }
        };

        self.total_bytes += size_to_alloc;
        #[cfg(feature = "tracking")]
        {
            self.spans_from_backing += 1;
        }
        debug!(
            "region pool: grew by {} bytes at {:#x} for a {} byte request",
            size_to_alloc, data, size
        );

        let mut prev = 0;
        let mut next = self.free_head;
        while next != 0 && self.blk(next).addr < data {
            prev = next;
            next = self.blk(next).next;
        }

        let at = node.as_ptr() as usize;
        unsafe {
            node.as_ptr().write(Block {
                addr: data,
                len: size_to_alloc,
                is_head: true,
                next,
            });
        }
        if prev != 0 {
            self.blk_mut(prev).next = at;
        } else {
            self.free_head = at;
        }
        Ok((at, prev))
    }

    /// Take `curr` out of the free list, leaving the cut-off tail behind when
    /// the fit is not exact. An aligned exact fit keeps the block whole. The
    /// cut is padded to `align` so the tail can serve later requests with
    /// the same alignment.
    fn split_block(&mut self, curr: usize, prev: usize, size: usize, align: usize) -> AllocResult<()> {
        let cut = align_up(size, align);
        let aligned_size = align_up(size, ALIGNMENT_BOUNDARY);
        let b = *self.blk(curr);

        let replacement = if b.len == size || b.len == aligned_size || b.len <= cut {
            b.next
        } else {
            let node = self.block_pool.try_allocate()?;
            let tail = node.as_ptr() as usize;
            unsafe {
                node.as_ptr().write(Block {
                    addr: b.addr + cut,
                    len: b.len - cut,
                    is_head: false,
                    next: b.next,
                });
            }
            self.blk_mut(curr).len = cut;
            tail
        };

        if prev != 0 {
            self.blk_mut(prev).next = replacement;
        } else {
            self.free_head = replacement;
        }
        Ok(())
    }

    /// Move a used block back into the free list and merge it with abutting
    /// neighbors. A merge never crosses a backing-span boundary: the
    /// right-hand block of a candidate pair must not be a head.
    fn release_block(&mut self, curr: usize, used_prev: usize) {
        debug_assert!(curr != 0);

        // Unlink from the used list.
        let after = self.blk(curr).next;
        if used_prev != 0 {
            self.blk_mut(used_prev).next = after;
        } else {
            self.used_head = after;
        }

        // Locate the sorted position in the free list.
        let curr_addr = self.blk(curr).addr;
        let mut prev = 0;
        let mut walk = self.free_head;
        while walk != 0 && self.blk(walk).addr < curr_addr {
            prev = walk;
            walk = self.blk(walk).next;
        }
        let next = walk;

        // Merge with the predecessor, unless the freed block starts a span.
        let mut curr = curr;
        if prev != 0 && self.blk(prev).end() == curr_addr && !self.blk(curr).is_head {
            let grown = self.blk(curr).len;
            self.blk_mut(prev).len += grown;
            self.free_meta(curr);
            curr = prev;
        } else if prev != 0 {
            self.blk_mut(prev).next = curr;
        } else {
            self.free_head = curr;
        }

        // Merge with the successor, unless the successor starts a span.
        if next != 0 && self.blk(curr).end() == self.blk(next).addr && !self.blk(next).is_head {
            let Block {
                len: next_len,
                next: next_next,
                ..
            } = *self.blk(next);
            self.blk_mut(curr).len += next_len;
            self.blk_mut(curr).next = next_next;
            self.free_meta(next);
        } else {
            self.blk_mut(curr).next = next;
        }
    }

    /// Hand out a region of at least `size` bytes.
    ///
    /// The tightest free block wins; when none fits, a span of
    /// `max(align_up(size, 16), min_bytes)` is obtained from the backing
    /// source first. A reused region starts exactly where the allocation
    /// that carved it ended; callers that need a particular start alignment
    /// use [`try_allocate_aligned`](Self::try_allocate_aligned).
    pub fn try_allocate(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        self.try_allocate_aligned(size, 1)
    }

    /// Hand out a region of at least `size` bytes starting at an address
    /// aligned to `align`.
    ///
    /// Free blocks whose start address does not satisfy `align` are passed
    /// over, and a split cut is padded to `align` so the remainder stays
    /// usable for later requests with the same alignment. `align` must be a
    /// power of two no larger than [`ALIGNMENT_BOUNDARY`], the alignment the
    /// backing source guarantees on fresh spans.
    pub fn try_allocate_aligned(&mut self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        if size == 0 || !align.is_power_of_two() || align > ALIGNMENT_BOUNDARY {
            return Err(AllocError::InvalidParam);
        }

        let (mut best, mut prev) = self.find_usable_block(size, align);
        if best == 0 {
            let (grown, grown_prev) = self.grow(size)?;
            best = grown;
            prev = grown_prev;
        }

        self.split_block(best, prev, size, align)?;

        let used_head = self.used_head;
        let published_len = {
            let b = self.blk_mut(best);
            b.next = used_head;
            b.len
        };
        self.used_head = best;
        self.alloc_bytes += published_len;
        #[cfg(feature = "tracking")]
        {
            self.total_allocations += 1;
        }

        let addr = self.blk(best).addr;
        debug_assert!(is_aligned(addr, align));
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Like [`try_allocate`](Self::try_allocate), but treats backing or
    /// metadata exhaustion as fatal.
    pub fn allocate(&mut self, size: usize) -> NonNull<u8> {
        match self.try_allocate(size) {
            Ok(ptr) => ptr,
            Err(e) => panic!("region pool: allocation of {} bytes failed: {:?}", size, e),
        }
    }

    /// Like [`try_allocate_aligned`](Self::try_allocate_aligned), but treats
    /// backing or metadata exhaustion as fatal.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> NonNull<u8> {
        match self.try_allocate_aligned(size, align) {
            Ok(ptr) => ptr,
            Err(e) => panic!(
                "region pool: allocation of {} bytes aligned to {} failed: {:?}",
                size, align, e
            ),
        }
    }

    /// Return a region to the pool.
    ///
    /// A pointer that does not match the start of a live allocation is
    /// reported and otherwise ignored; a double free collapses to the same
    /// case.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;

        let mut prev = 0;
        let mut curr = self.used_head;
        while curr != 0 && self.blk(curr).addr != addr {
            prev = curr;
            curr = self.blk(curr).next;
        }
        if curr == 0 {
            error!("region pool: pointer {:#x} is not an allocated region", addr);
            return;
        }

        self.alloc_bytes -= self.blk(curr).len;
        #[cfg(feature = "tracking")]
        {
            self.total_deallocations += 1;
        }
        self.release_block(curr, prev);
    }

    /// Bytes currently reserved for callers: the summed lengths of the
    /// used-list blocks.
    pub fn allocated_size(&self) -> usize {
        self.alloc_bytes
    }

    /// Bytes held from the backing source, including the metadata pool's
    /// slabs.
    pub fn total_size(&self) -> usize {
        self.total_bytes + self.block_pool.total_size()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.iter_free().count()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.iter_used().count()
    }

    /// Snapshot iterator over the free list, in ascending address order.
    pub fn iter_free(&self) -> BlockIter<'_> {
        BlockIter::new(self.free_head)
    }

    /// Snapshot iterator over the used list, most recently allocated first.
    pub fn iter_used(&self) -> BlockIter<'_> {
        BlockIter::new(self.used_head)
    }

    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> RegionPoolStats {
        RegionPoolStats {
            total_bytes: self.total_bytes,
            allocated_bytes: self.alloc_bytes,
            free_blocks: self.num_free_blocks(),
            used_blocks: self.num_used_blocks(),
            total_allocations: self.total_allocations,
            total_deallocations: self.total_deallocations,
            spans_from_backing: self.spans_from_backing,
        }
    }
}

impl<MA: BackingAllocator, IA: BackingAllocator> Drop for RegionPool<MA, IA> {
    fn drop(&mut self) {
        // Release every used block into the free list; coalescing restores
        // each backing span to a single head block.
        while self.used_head != 0 {
            let head = self.used_head;
            self.release_block(head, 0);
        }
        self.alloc_bytes = 0;

        while self.free_head != 0 {
            let at = self.free_head;
            let block = *self.blk(at);
            debug_assert!(block.is_head);
            self.backing.deallocate(block.addr);
            self.total_bytes -= block.len;
            self.free_head = block.next;
            self.free_meta(at);
        }
        debug_assert_eq!(self.total_bytes, 0);
    }
}
