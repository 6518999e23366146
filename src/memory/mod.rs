/*
 * Memory Management
 *
 * High-level module that ties together:
 *  - Physical frame allocator (phys)
 *  - Paging / virtual memory manager (paging)
 *  - Kernel heap (heap)
 */

pub mod heap;
pub mod paging;
pub mod paging32;
pub mod phys;
pub mod physmap;
pub mod refcount;
pub mod vrange;
pub mod types;

// `address_space` predated the tasking core's own `paging32`/`refcount`/
// `vrange` trio, which now owns everything about per-process address
// spaces, and was deleted in the final trimming pass (see DESIGN.md).
// `types` stays: `paging` (the kernel-heap mapper, still load-bearing)
// imports its `PhysFrame`/`PageTableFlags` from it.

use crate::bootboot::BOOTBOOT;

/// Physical frame representation (4 KiB)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct PhysFrame(u64);

impl PhysFrame {
    pub const SIZE: u64 = 4096;

    pub fn containing_address(addr: u64) -> Self {
        Self(addr & !0xfff)
    }

    pub fn start_address(&self) -> u64 {
        self.0
    }

    pub fn end_address(&self) -> u64 {
        self.0 + Self::SIZE - 1
    }
}

/// Top-level memory initialization:
///  1. Physical frame allocator from BOOTBOOT memory map
///  2. Physical memory direct map (physmap), which `paging` and the
///     tasking core's `paging32` both read/write page tables through
///  3. Kernel heap
pub fn init(bootboot_ptr: *const BOOTBOOT) {
    log::info!("Initializing memory management...");

    // 1) Physical frames
    phys::init_from_bootboot(bootboot_ptr);

    // 2) Physmap. BOOTBOOT identity-maps all of RAM already, so the
    // direct map is usable immediately; `activate()` only flips the
    // bookkeeping flag `paging`/`paging32` check before trusting it.
    unsafe {
        physmap::init(phys::MAX_MANAGED_PHYS);
        physmap::activate();
    }

    // 3) Heap
    heap::init().expect("Failed to initialize kernel heap");

    let (used, total) = phys::get_stats();
    log::info!(
        "Physical memory: used frames = {}, total frames = {}",
        used,
        total
    );
}
