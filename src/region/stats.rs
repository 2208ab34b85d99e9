//! Cumulative statistics for the region pool.

/// Snapshot of a region pool's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionPoolStats {
    /// Bytes currently held from the backing source (data spans only).
    pub total_bytes: usize,
    /// Bytes currently reserved for callers.
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    pub total_allocations: usize,
    pub total_deallocations: usize,
    /// Number of spans ever requested from the backing source.
    pub spans_from_backing: usize,
}
