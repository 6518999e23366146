/*
 * Tasking Core - Collaborator Contracts
 *
 * Everything the tasking core needs but does not own: physical frames,
 * page tables, per-frame reference counts, virtual address ranges, the
 * GDT/TSS, the wait/sleep subsystem, and the per-process filesystem
 * record. Each is a trait so the core's control flow (thread creation,
 * context switch, teardown) can be exercised in `#[cfg(test)]` against
 * hand-rolled fakes instead of real page tables.
 *
 * `collaborators::Collaborators` bundles one of each and is threaded
 * through `tasking::core` by `&dyn` reference; production code wires it
 * to the adapters in `memory::paging32`, `memory::refcount`,
 * `memory::vrange`, `memory::phys`, and `arch::x86_64::gdt`.
 */

use x86_64::VirtAddr;

use super::types::{ThreadId, ProcessId};

/// Physical frame provider. Frames are always exactly `PAGE_SIZE` and
/// physically contiguous; this core never allocates multi-frame runs
/// itself.
pub trait FrameAllocatorContract {
    /// Allocate one zeroed-on-demand physical frame, or `None` if exhausted.
    fn allocate(&self) -> Option<u64>;
    /// Return a frame to the free pool. Must not be called twice for the
    /// same frame without an intervening `allocate`.
    fn mark_free(&self, phys_addr: u64);
}

/// Flags a mapping can carry. Deliberately narrower than the paging
/// layer's real flag set: the tasking core only ever asks for these
/// combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFlags {
    pub user_accessible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags {
    pub writable: bool,
    pub user_accessible: bool,
}

/// Maps/unmaps virtual-to-physical, and switches the active address
/// space. The tasking core never walks page tables directly except for
/// the teardown sweep in `remove_process`, which owns its walk in
/// `memory::paging32` because the exact skip-index-0 behavior is a
/// tested invariant of this core, not a detail the paging layer hides.
pub trait PagingContract {
    fn map_page(&self, vaddr: VirtAddr, paddr: u64, table_flags: TableFlags, page_flags: PageFlags);
    fn unmap_page(&self, vaddr: VirtAddr);
    fn virtual_to_physical(&self, vaddr: VirtAddr) -> Option<u64>;
    fn switch_to_space(&self, phys_dir: u64);
    fn current_space(&self) -> u64;
    /// Allocate a fresh page directory frame for a new process, with the
    /// shared kernel region (directory index 0) already populated.
    fn new_directory(&self) -> Option<u64>;
    /// Free a page directory frame. Caller must have already walked and
    /// released every page it referenced.
    fn free_directory(&self, phys_dir: u64);
}

/// Per-physical-frame reference counting, so a frame mapped into several
/// address spaces (TLS masters, shared kernel pages) is freed only once
/// the last mapping drops it (invariant 4).
pub trait FrameRefTrackerContract {
    fn increment(&self, phys_addr: u64);
    /// Decrements and returns the remaining count.
    fn decrement(&self, phys_addr: u64) -> u64;
}

/// Per-address-space virtual range sub-allocator. One instance per
/// process (user ranges) plus one shared instance for kernel-thread
/// stacks.
pub trait VirtualRangePoolContract {
    fn add_range(&self, start: VirtAddr, end: VirtAddr);
    fn allocate(&self, pages: usize, tag: VirtualRangeTag) -> Option<VirtAddr>;
    fn free(&self, vaddr: VirtAddr);
}

/// What a virtual range allocation is for. Only used by fakes/adapters
/// that want to assert callers free what they asked for; the tasking
/// core itself treats it as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualRangeTag {
    KernelStack,
    InterruptStack,
    Tls,
}

/// The two GDT/TSS mutations the context-switch path needs on every
/// restore.
pub trait GdtContract {
    fn set_user_thread_object_address(&self, vaddr: VirtAddr);
    fn set_tss_esp0(&self, vaddr: VirtAddr);
}

/// Blocks the calling thread. Used only by the reaper, which sleeps
/// itself between passes (Design Notes Open Question 2).
pub trait WaitContract {
    fn sleep(&self, task: ThreadId, ms: u32);
}

/// Per-process record kept by the filesystem layer, created on main-thread
/// attach and dropped on process teardown.
pub trait FilesystemContract {
    fn process_create(&self, pid: ProcessId);
    fn process_remove(&self, pid: ProcessId);
}

/// Bundles one of each collaborator. `tasking::core` takes `&dyn
/// Collaborators` so production code and tests can each supply their own
/// wiring without the core depending on concrete memory/arch types.
pub trait Collaborators {
    fn frames(&self) -> &dyn FrameAllocatorContract;
    fn paging(&self) -> &dyn PagingContract;
    fn refcount(&self) -> &dyn FrameRefTrackerContract;
    fn vrange_kernel(&self) -> &dyn VirtualRangePoolContract;
    fn gdt(&self) -> &dyn GdtContract;
    fn wait(&self) -> &dyn WaitContract;
    fn filesystem(&self) -> &dyn FilesystemContract;
}
