/*
 * Two-Level Page Directory/Table Walker
 *
 * Models the spec's IA-32 two-level paging scheme directly: one 1024-entry
 * directory per process, each present entry pointing at a 1024-entry table
 * of 4 KiB pages (4 MiB covered per table). This is a structure the
 * tasking core owns and walks itself — kept separate from the host's
 * native four-level tables that `memory::address_space`/`memory::paging`
 * still use to back the kernel's own real translation — because
 * `remove_process`'s directory-index-1..1024 sweep is a tested invariant
 * of this core (Design Notes Open Question 3), not a detail a generic
 * paging layer should hide.
 *
 * Entries are stored as 64-bit words (wider than a real IA-32 PDE/PTE)
 * since the frame addresses they carry come from a physical space sized
 * for this host, but the layout — present/writable/user bits low, frame
 * address masked to the page boundary — mirrors the IA-32 shape exactly.
 */

use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::physmap::{phys_to_virt, read_phys, write_phys};
use crate::memory::{phys, PhysFrame};
use crate::tasking::collaborators::{FrameAllocatorContract, PageFlags, PagingContract, TableFlags};
use crate::tasking::types::{PAGE_SIZE, PAGE_TABLE_ENTRIES};

const PRESENT: u64 = 1 << 0;
const WRITABLE: u64 = 1 << 1;
const USER: u64 = 1 << 2;
const FRAME_MASK: u64 = !0xfff;

fn entry_addr(table_phys: u64, index: usize) -> PhysAddr {
    PhysAddr::new(table_phys + (index as u64) * 8)
}

fn read_entry(table_phys: u64, index: usize) -> u64 {
    unsafe { read_phys(entry_addr(table_phys, index)) }
}

fn write_entry(table_phys: u64, index: usize, entry: u64) {
    unsafe { write_phys(entry_addr(table_phys, index), entry) }
}

fn dir_index(vaddr: VirtAddr) -> usize {
    ((vaddr.as_u64() >> 22) & 0x3ff) as usize
}

fn table_index(vaddr: VirtAddr) -> usize {
    ((vaddr.as_u64() >> 12) & 0x3ff) as usize
}

/// The directory the next `map_page`/`unmap_page`/`virtual_to_physical`
/// call operates against; set by `switch_to_space` (4.5's temporary
/// borrow and 4.7's restore both go through here).
static CURRENT_DIRECTORY: Mutex<u64> = Mutex::new(0);

fn alloc_zeroed_frame() -> Option<u64> {
    let frame = phys::alloc_frame()?;
    let phys_addr = frame.start_address();
    let base = phys_to_virt(PhysAddr::new(phys_addr));
    unsafe {
        core::ptr::write_bytes(base.as_mut_ptr::<u8>(), 0u8, PAGE_SIZE);
    }
    Some(phys_addr)
}

/// `FrameAllocatorContract` adapter wrapping `memory::phys`.
pub struct Frames;

impl FrameAllocatorContract for Frames {
    fn allocate(&self) -> Option<u64> {
        alloc_zeroed_frame()
    }

    fn mark_free(&self, phys_addr: u64) {
        phys::free_frame(PhysFrame::containing_address(phys_addr));
    }
}

/// `PagingContract` adapter over the two-level model above.
pub struct Paging32;

impl PagingContract for Paging32 {
    fn map_page(&self, vaddr: VirtAddr, paddr: u64, table_flags: TableFlags, page_flags: PageFlags) {
        let dir_phys = *CURRENT_DIRECTORY.lock();
        let di = dir_index(vaddr);
        let mut dir_entry = read_entry(dir_phys, di);

        if dir_entry & PRESENT == 0 {
            let table_phys = alloc_zeroed_frame().expect("page table allocation assumed infallible (Design §7)");
            dir_entry = table_phys | PRESENT | WRITABLE | if table_flags.user_accessible { USER } else { 0 };
            write_entry(dir_phys, di, dir_entry);
        }

        let table_phys = dir_entry & FRAME_MASK;
        let ti = table_index(vaddr);
        let mut page_entry = paddr & FRAME_MASK;
        page_entry |= PRESENT;
        if page_flags.writable {
            page_entry |= WRITABLE;
        }
        if page_flags.user_accessible {
            page_entry |= USER;
        }
        write_entry(table_phys, ti, page_entry);
    }

    fn unmap_page(&self, vaddr: VirtAddr) {
        let dir_phys = *CURRENT_DIRECTORY.lock();
        let di = dir_index(vaddr);
        let dir_entry = read_entry(dir_phys, di);
        if dir_entry & PRESENT == 0 {
            return;
        }
        let table_phys = dir_entry & FRAME_MASK;
        write_entry(table_phys, table_index(vaddr), 0);
    }

    fn virtual_to_physical(&self, vaddr: VirtAddr) -> Option<u64> {
        let dir_phys = *CURRENT_DIRECTORY.lock();
        let dir_entry = read_entry(dir_phys, dir_index(vaddr));
        if dir_entry & PRESENT == 0 {
            return None;
        }
        let table_phys = dir_entry & FRAME_MASK;
        let page_entry = read_entry(table_phys, table_index(vaddr));
        if page_entry & PRESENT == 0 {
            return None;
        }
        Some((page_entry & FRAME_MASK) | (vaddr.as_u64() & 0xfff))
    }

    fn switch_to_space(&self, phys_dir: u64) {
        *CURRENT_DIRECTORY.lock() = phys_dir;
    }

    fn current_space(&self) -> u64 {
        *CURRENT_DIRECTORY.lock()
    }

    fn new_directory(&self) -> Option<u64> {
        let dir_phys = alloc_zeroed_frame()?;
        // Directory index 0 (the low shared kernel region) is copied from
        // whichever directory is currently active, so a fresh process can
        // service the handful of kernel-owned mappings without faulting
        // (Design Notes Open Question 3).
        let boot_dir = *CURRENT_DIRECTORY.lock();
        if boot_dir != 0 {
            write_entry(dir_phys, 0, read_entry(boot_dir, 0));
        }
        Some(dir_phys)
    }

    fn free_directory(&self, phys_dir: u64) {
        phys::free_frame(PhysFrame::containing_address(phys_dir));
    }
}

/// Walk every user-flagged table of `phys_dir` (directory indices `1..1024`,
/// skipping index 0's shared kernel region and any table mapped without
/// `USER` — e.g. a thread's own kernel/interrupt stacks, which
/// `tasking::core::map_fresh_stack` always maps with `table_flags.user_accessible
/// = false`), invoking `callback` once per present page frame. Used by
/// `tasking::core::remove_process` to release a dying process's user pages;
/// the directory frame itself is freed separately by `PagingContract::free_directory`.
pub fn walk_user_frames(phys_dir: u64, mut callback: impl FnMut(u64)) {
    for di in 1..PAGE_TABLE_ENTRIES {
        let dir_entry = read_entry(phys_dir, di);
        if dir_entry & PRESENT == 0 || dir_entry & USER == 0 {
            continue;
        }
        let table_phys = dir_entry & FRAME_MASK;
        for ti in 0..PAGE_TABLE_ENTRIES {
            let page_entry = read_entry(table_phys, ti);
            if page_entry & PRESENT != 0 {
                callback(page_entry & FRAME_MASK);
            }
        }
    }
}
