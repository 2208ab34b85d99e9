//! Region pool integration tests.
//!
//! Walks the pool through concrete allocate/deallocate scenarios against a
//! recording backing, and stress-checks the list invariants over a long
//! pseudo-random operation sequence.

#![no_std]

extern crate alloc;
extern crate slab_region_allocator;

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::cell::RefCell;
use core::ptr::NonNull;

use slab_region_allocator::{
    AllocResult, BackingAllocator, BlockInfo, RegionPool, ALIGNMENT_BOUNDARY,
};

/// Everything a backing ever did, for pairing and leak checks.
#[derive(Default)]
struct BackingState {
    live: Vec<(usize, Layout)>,
    allocate_sizes: Vec<usize>,
    handed_out: Vec<usize>,
    returned: Vec<usize>,
}

/// Backing over the test heap that records every span it hands out.
#[derive(Clone, Default)]
struct RecordingBacking {
    state: Rc<RefCell<BackingState>>,
}

impl BackingAllocator for RecordingBacking {
    fn allocate(&mut self, bytes: usize) -> AllocResult<usize> {
        let layout = Layout::from_size_align(bytes, ALIGNMENT_BOUNDARY).unwrap();
        let addr = unsafe { alloc::alloc::alloc(layout) } as usize;
        assert_ne!(addr, 0, "test heap exhausted");
        let mut state = self.state.borrow_mut();
        state.live.push((addr, layout));
        state.allocate_sizes.push(bytes);
        state.handed_out.push(addr);
        Ok(addr)
    }

    fn deallocate(&mut self, addr: usize) {
        let mut state = self.state.borrow_mut();
        let idx = state
            .live
            .iter()
            .position(|&(a, _)| a == addr)
            .expect("span returned twice or never handed out");
        let (_, layout) = state.live.swap_remove(idx);
        state.returned.push(addr);
        unsafe { alloc::alloc::dealloc(addr as *mut u8, layout) };
    }
}

type TestPool = RegionPool<RecordingBacking, RecordingBacking>;

fn pool_with_min_bytes(
    min_bytes: usize,
) -> (TestPool, Rc<RefCell<BackingState>>, Rc<RefCell<BackingState>>) {
    let data = RecordingBacking::default();
    let meta = RecordingBacking::default();
    let data_state = data.state.clone();
    let meta_state = meta.state.clone();
    (
        TestPool::with_backings(data, meta, min_bytes),
        data_state,
        meta_state,
    )
}

#[test]
fn test_exact_fit_after_alignment() {
    let (mut pool, data, _meta) = pool_with_min_bytes(256);

    let p = pool.allocate(1000);

    // One span of align_up(1000, 16) = 1008 bytes, used whole: no split.
    assert_eq!(data.borrow().allocate_sizes.as_slice(), &[1008]);
    assert_eq!(pool.num_used_blocks(), 1);
    assert_eq!(pool.num_free_blocks(), 0);
    let used: Vec<BlockInfo> = pool.iter_used().collect();
    assert_eq!(used[0].len, 1008);
    assert!(used[0].is_head);
    assert_eq!(pool.allocated_size(), 1008);

    pool.deallocate(p);
    assert_eq!(pool.allocated_size(), 0);
}

#[test]
fn test_growth_floor_forces_split() {
    let (mut pool, data, _meta) = pool_with_min_bytes(4096);

    let p = pool.allocate(100);

    assert_eq!(data.borrow().allocate_sizes.as_slice(), &[4096]);
    let used: Vec<BlockInfo> = pool.iter_used().collect();
    let free: Vec<BlockInfo> = pool.iter_free().collect();
    assert_eq!(used.len(), 1);
    assert_eq!(used[0].len, 100);
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].len, 3996);
    assert!(!free[0].is_head);
    assert_eq!(pool.allocated_size(), 100);

    pool.deallocate(p);
}

#[test]
fn test_out_of_order_frees_coalesce_to_one_head() {
    let (mut pool, data, _meta) = pool_with_min_bytes(4096);

    let a = pool.allocate(100);
    let b = pool.allocate(200);
    let c = pool.allocate(300);
    assert_eq!(data.borrow().allocate_sizes.as_slice(), &[4096]);

    pool.deallocate(a);
    pool.deallocate(c);
    pool.deallocate(b);

    let free: Vec<BlockInfo> = pool.iter_free().collect();
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].len, 4096);
    assert!(free[0].is_head);
    assert_eq!(free[0].addr, data.borrow().handed_out[0]);
    assert_eq!(pool.num_used_blocks(), 0);
    assert_eq!(pool.allocated_size(), 0);
}

#[test]
fn test_best_fit_picks_the_hole() {
    let (mut pool, _data, _meta) = pool_with_min_bytes(4096);

    let a = pool.allocate(100);
    let b = pool.allocate(100);
    pool.deallocate(a);

    // The freed 100-byte hole is tighter than the large tail fragment.
    let c = pool.allocate(50);
    assert_eq!(c, a);

    let free: Vec<BlockInfo> = pool.iter_free().collect();
    assert!(free
        .iter()
        .any(|f| f.addr == a.as_ptr() as usize + 50 && f.len == 50 && !f.is_head));

    pool.deallocate(b);
    pool.deallocate(c);
}

#[test]
fn test_spans_never_merge_across_heads() {
    let (mut pool, data, _meta) = pool_with_min_bytes(4096);

    // A fills its span exactly; B cannot fit there and forces a second span.
    let a = pool.allocate(4096);
    let b = pool.allocate(8192);
    assert_eq!(data.borrow().allocate_sizes.as_slice(), &[4096, 8192]);

    pool.deallocate(a);
    pool.deallocate(b);

    // Both spans survive as separate head blocks, adjacent or not.
    let free: Vec<BlockInfo> = pool.iter_free().collect();
    assert_eq!(free.len(), 2);
    assert!(free.iter().all(|f| f.is_head));
    let mut lens: Vec<usize> = free.iter().map(|f| f.len).collect();
    lens.sort_unstable();
    assert_eq!(lens, [4096, 8192]);
}

#[test]
fn test_steady_state_churn_stays_in_first_span() {
    let (mut pool, data, _meta) = pool_with_min_bytes(4096);

    for _ in 0..100_000 {
        let p = pool.allocate(64);
        assert!(pool.num_free_blocks() <= 1);
        pool.deallocate(p);
        assert!(pool.num_free_blocks() <= 1);
    }

    // The first span serves the whole run.
    assert_eq!(data.borrow().allocate_sizes.len(), 1);
}

#[test]
fn test_drop_returns_every_span_exactly_once() {
    let (mut pool, data, meta) = pool_with_min_bytes(512);

    let _a = pool.allocate(100);
    let _b = pool.allocate(2000);
    let c = pool.allocate(300);
    pool.deallocate(c);
    drop(pool);

    let data = data.borrow();
    assert!(data.live.is_empty());
    let mut handed = data.handed_out.clone();
    let mut returned = data.returned.clone();
    handed.sort_unstable();
    returned.sort_unstable();
    assert_eq!(handed, returned);

    // Metadata slabs go back too.
    let meta = meta.borrow();
    assert!(meta.live.is_empty());
    assert_eq!(meta.handed_out.len(), meta.returned.len());
}

/// xorshift64 - deterministic sequence, no external crates.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

fn check_list_invariants(pool: &TestPool, live: &[(NonNull<u8>, usize)]) {
    let used: Vec<BlockInfo> = pool.iter_used().collect();
    let free: Vec<BlockInfo> = pool.iter_free().collect();

    // Counters agree with the lists.
    assert_eq!(used.len(), live.len());
    assert_eq!(pool.num_used_blocks(), used.len());
    assert_eq!(pool.num_free_blocks(), free.len());
    assert_eq!(pool.allocated_size(), used.iter().map(|b| b.len).sum::<usize>());

    // Free list is strictly address-sorted and maximally coalesced.
    for pair in free.windows(2) {
        assert!(pair[0].addr < pair[1].addr);
        assert!(
            !(pair[0].addr + pair[0].len == pair[1].addr && !pair[1].is_head),
            "adjacent free blocks left unmerged"
        );
    }

    // The two lists are disjoint.
    for u in &used {
        assert!(free.iter().all(|f| f.addr != u.addr));
    }
}

fn check_span_invariants(pool: &TestPool, data: &Rc<RefCell<BackingState>>) {
    let used: Vec<BlockInfo> = pool.iter_used().collect();
    let free: Vec<BlockInfo> = pool.iter_free().collect();

    // Every block sits inside exactly one live backing span, and no two
    // blocks overlap.
    let state = data.borrow();
    let mut blocks: Vec<BlockInfo> = used.iter().chain(free.iter()).copied().collect();
    blocks.sort_unstable_by_key(|b| b.addr);
    for pair in blocks.windows(2) {
        assert!(pair[0].addr + pair[0].len <= pair[1].addr, "blocks overlap");
    }
    for b in &blocks {
        let holders = state
            .live
            .iter()
            .filter(|&&(addr, layout)| b.addr >= addr && b.addr + b.len <= addr + layout.size())
            .count();
        assert_eq!(holders, 1, "block not contained in exactly one span");
    }

    // Conservation: every backing byte is in one of the two lists.
    let span_sum: usize = state.live.iter().map(|&(_, layout)| layout.size()).sum();
    let block_sum: usize = blocks.iter().map(|b| b.len).sum();
    assert_eq!(span_sum, block_sum);
}

#[test]
fn test_random_churn_keeps_invariants() {
    let (mut pool, data, meta) = pool_with_min_bytes(256);
    let mut rng = Rng(0x9e37_79b9_7f4a_7c15);
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    for step in 0..2000 {
        let allocate = live.is_empty() || rng.below(100) < 55;
        if allocate {
            let size = 1 + rng.below(700);
            let ptr = pool.allocate(size);
            // Touch both ends of the region.
            unsafe {
                ptr.as_ptr().write(step as u8);
                ptr.as_ptr().add(size - 1).write(step as u8);
            }
            live.push((ptr, size));
        } else {
            let idx = rng.below(live.len());
            let (ptr, _) = live.swap_remove(idx);
            pool.deallocate(ptr);
        }
        check_list_invariants(&pool, &live);
        if step % 32 == 0 {
            check_span_invariants(&pool, &data);
        }
    }
    check_span_invariants(&pool, &data);

    // Tear down from a live state; every span must come back exactly once.
    drop(pool);
    assert!(data.borrow().live.is_empty());
    assert!(meta.borrow().live.is_empty());
    assert_eq!(
        data.borrow().handed_out.len(),
        data.borrow().returned.len()
    );
}
