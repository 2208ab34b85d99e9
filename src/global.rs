//! Process-wide region pool.
//!
//! A single `RegionPool<ProcessHeap>` covers the whole program: it is
//! created lazily on first use and lives until process exit (Rust statics
//! are never dropped, so its spans are reclaimed by the OS rather than by
//! the pool's own teardown). [`PooledHeap`] exposes it through
//! `core::alloc::GlobalAlloc`, so it can be installed with
//! `#[global_allocator]` to route every program allocation through the pool.
//!
//! The pool itself is single-threaded; a busy flag serializes access so the
//! handle can be `Sync`.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "log")]
use log::warn;

use crate::{is_aligned, ProcessHeap, RegionPool, ALIGNMENT_BOUNDARY};

type GlobalPool = RegionPool<ProcessHeap, ProcessHeap>;

/// Holder of the process-wide pool. Access is closure-scoped: the pool is
/// only ever touched inside [`PoolCell::with`], which busy-waits on the
/// flag, so there is no guard type to hold across statements.
struct PoolCell {
    busy: AtomicBool,
    pool: UnsafeCell<Option<GlobalPool>>,
}

// The pool is only reachable through `with`, one caller at a time.
unsafe impl Sync for PoolCell {}

impl PoolCell {
    const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            pool: UnsafeCell::new(None),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut GlobalPool) -> R) -> R {
        while self.busy.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
        // Clear the flag even if `f` unwinds.
        struct Clear<'a>(&'a AtomicBool);
        impl Drop for Clear<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _clear = Clear(&self.busy);

        let pool = unsafe { &mut *self.pool.get() };
        f(pool.get_or_insert_with(|| RegionPool::new(ProcessHeap)))
    }
}

static GLOBAL_POOL: PoolCell = PoolCell::new();

/// Run `f` against the process-wide pool, creating it on first use.
///
/// `ProcessHeap` calls `malloc` directly, so the pool keeps working even
/// when [`PooledHeap`] is the program's global allocator - growth never
/// re-enters the pool.
pub(crate) fn with_pool<R>(f: impl FnOnce(&mut GlobalPool) -> R) -> R {
    GLOBAL_POOL.with(f)
}

/// Handle over the process-wide pool, usable as the program allocator:
///
/// ```no_run
/// use slab_region_allocator::PooledHeap;
///
/// #[global_allocator]
/// static ALLOC: PooledHeap = PooledHeap::new();
///
/// fn main() {}
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct PooledHeap;

impl PooledHeap {
    pub const fn new() -> Self {
        Self
    }

    /// Bytes currently reserved for callers of the process-wide pool.
    pub fn allocated_size(&self) -> usize {
        with_pool(|pool| pool.allocated_size())
    }

    /// Bytes the process-wide pool holds from the heap, metadata included.
    pub fn total_size(&self) -> usize {
        with_pool(|pool| pool.total_size())
    }

    pub fn num_free_blocks(&self) -> usize {
        with_pool(|pool| pool.num_free_blocks())
    }

    pub fn num_used_blocks(&self) -> usize {
        with_pool(|pool| pool.num_used_blocks())
    }
}

unsafe impl GlobalAlloc for PooledHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return core::ptr::null_mut();
        }
        if layout.align() > ALIGNMENT_BOUNDARY {
            warn!(
                "pooled heap: alignment {} exceeds the supported boundary",
                layout.align()
            );
            return core::ptr::null_mut();
        }
        with_pool(|pool| {
            match pool.try_allocate_aligned(layout.size(), layout.align()) {
                Ok(ptr) => {
                    // Never hand back an address the layout cannot accept.
                    if is_aligned(ptr.as_ptr() as usize, layout.align()) {
                        ptr.as_ptr()
                    } else {
                        pool.deallocate(ptr);
                        core::ptr::null_mut()
                    }
                }
                Err(_) => core::ptr::null_mut(),
            }
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            with_pool(|pool| pool.deallocate(ptr));
        }
    }
}
