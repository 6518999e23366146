/*
 * Virtual Range Pool
 *
 * A bump-then-freelist sub-allocator over a fixed virtual address window,
 * handing out page runs tagged by what they are for (kernel stack,
 * interrupt stack, TLS). One instance lives inside each `Process` for its
 * own address space; a second, shared instance backs every kernel
 * thread's stack allocation regardless of which process it's attached to.
 */

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::tasking::collaborators::{VirtualRangePoolContract, VirtualRangeTag};
use crate::tasking::types::PAGE_SIZE;

/// Default per-process virtual window for task-owned stacks/TLS, clear of
/// the fixed regions `memory::address_space::layout` reserves for the
/// heap and the user stack.
const DEFAULT_BASE: u64 = 0x7000_0000;
const DEFAULT_LIMIT: u64 = 0x7800_0000;

/// Shared window kernel-thread stacks are drawn from, regardless of which
/// kernel process created the thread (4.11: "kernel threads to the shared
/// kernel virtual pool").
const KERNEL_BASE: u64 = 0xffff_ff00_0000_0000;
const KERNEL_LIMIT: u64 = 0xffff_ff80_0000_0000;

struct FreeRun {
    start: VirtAddr,
    pages: usize,
}

struct VirtualRangePoolInner {
    bump: VirtAddr,
    limit: VirtAddr,
    free: Vec<FreeRun>,
    /// Remembers how many pages each live allocation covers, since `free`
    /// is only given the start address (matching the spec's `free(vaddr)`
    /// signature).
    allocated: BTreeMap<VirtAddr, usize>,
}

pub struct VirtualRangePool {
    inner: Mutex<VirtualRangePoolInner>,
}

impl VirtualRangePool {
    pub fn new() -> Self {
        Self::with_range(VirtAddr::new(DEFAULT_BASE), VirtAddr::new(DEFAULT_LIMIT))
    }

    pub fn with_range(base: VirtAddr, limit: VirtAddr) -> Self {
        VirtualRangePool {
            inner: Mutex::new(VirtualRangePoolInner {
                bump: base,
                limit,
                free: Vec::new(),
                allocated: BTreeMap::new(),
            }),
        }
    }

    /// The shared pool kernel-thread stacks come from.
    pub fn new_kernel() -> Self {
        Self::with_range(VirtAddr::new(KERNEL_BASE), VirtAddr::new(KERNEL_LIMIT))
    }
}

impl Default for VirtualRangePool {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualRangePoolContract for VirtualRangePool {
    fn add_range(&self, start: VirtAddr, end: VirtAddr) {
        let mut inner = self.inner.lock();
        inner.bump = start;
        inner.limit = end;
    }

    fn allocate(&self, pages: usize, _tag: VirtualRangeTag) -> Option<VirtAddr> {
        let mut inner = self.inner.lock();

        let start = if let Some(idx) = inner.free.iter().position(|run| run.pages >= pages) {
            let run = inner.free.remove(idx);
            if run.pages > pages {
                inner.free.push(FreeRun {
                    start: run.start + (pages * PAGE_SIZE) as u64,
                    pages: run.pages - pages,
                });
            }
            run.start
        } else {
            let size = (pages * PAGE_SIZE) as u64;
            let start = inner.bump;
            if start + size > inner.limit {
                return None;
            }
            inner.bump = start + size;
            start
        };

        inner.allocated.insert(start, pages);
        Some(start)
    }

    fn free(&self, vaddr: VirtAddr) {
        let mut inner = self.inner.lock();
        if let Some(pages) = inner.allocated.remove(&vaddr) {
            inner.free.push(FreeRun { start: vaddr, pages });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_non_overlapping_ranges() {
        let pool = VirtualRangePool::new();
        let a = pool.allocate(2, VirtualRangeTag::KernelStack).unwrap();
        let b = pool.allocate(3, VirtualRangeTag::InterruptStack).unwrap();
        assert_ne!(a, b);
        assert!(b >= a + (2 * PAGE_SIZE) as u64);
    }

    #[test]
    fn exhausts_when_range_runs_out() {
        let pool = VirtualRangePool::with_range(VirtAddr::new(0x1000), VirtAddr::new(0x3000));
        assert!(pool.allocate(1, VirtualRangeTag::Tls).is_some());
        assert!(pool.allocate(1, VirtualRangeTag::Tls).is_some());
        assert!(pool.allocate(1, VirtualRangeTag::Tls).is_none());
    }

    #[test]
    fn freed_range_is_reused() {
        let pool = VirtualRangePool::new();
        let a = pool.allocate(4, VirtualRangeTag::KernelStack).unwrap();
        pool.free(a);
        let b = pool.allocate(4, VirtualRangeTag::KernelStack).unwrap();
        assert_eq!(a, b);
    }
}
